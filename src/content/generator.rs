//! LLM-backed content generator.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::SenderProfile;
use crate::contacts::model::{Contact, Stage};
use crate::content::parse::parse_subject_body;
use crate::content::{ContentGenerator, EmailContent};
use crate::error::GenerationError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};

/// Placeholder the model is told to emit where the booking link belongs.
pub const BOOKING_LINK_PLACEHOLDER: &str = "[Booking Link]";

const CLASSIFY_TEMPERATURE: f32 = 0.0;
const OUTREACH_TEMPERATURE: f32 = 0.75;
const MEETING_TEMPERATURE: f32 = 0.5;

const FORMAT_RULES: &str = "Your response MUST be in the following format, with nothing before or after:\n\
    Subject: [Email Subject Line]\n\
    Body:\n\
    [Email Body Content]";

/// Generates classification labels and email copy with an `LlmProvider`.
pub struct LlmContentGenerator {
    llm: Arc<dyn LlmProvider>,
    profile: SenderProfile,
    max_tokens: u32,
}

impl LlmContentGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>, profile: SenderProfile) -> Self {
        Self {
            llm,
            profile,
            max_tokens: 700,
        }
    }

    /// Human label and goal line for a drip-sequence stage.
    fn stage_brief(&self, stage: Stage) -> (String, String) {
        let company = &self.profile.sender_company;
        match stage {
            Stage::Initial => (
                "an initial outreach email".to_string(),
                format!(
                    "The goal is to introduce {company} and explain how our services can help \
                     their business grow, prompting them to consider a partnership."
                ),
            ),
            Stage::Drip(1) => (
                "a Day 1 follow-up".to_string(),
                "The goal is to gently remind them of the initial email and re-engage them \
                 with a friendly check-in."
                    .to_string(),
            ),
            Stage::Drip(2) => (
                "a Day 2 follow-up".to_string(),
                "The goal is to provide a piece of value, like a relevant statistic for their \
                 industry, to demonstrate expertise."
                    .to_string(),
            ),
            Stage::Drip(n) => (
                format!("a Day {n} follow-up"),
                "This is a final, brief check-in. Keep it short and ask if the timing is not \
                 right, aiming for a definitive response."
                    .to_string(),
            ),
            Stage::MeetingRequest => (
                "a meeting request".to_string(),
                "Thank them for their reply and ask them to book a meeting.".to_string(),
            ),
        }
    }

    fn outreach_prompt(&self, contact: &Contact, stage: Stage) -> String {
        let (label, goal) = self.stage_brief(stage);
        format!(
            "You are {name}, a business development expert at {company}.\n\
             You are drafting {label} to a potential client.\n\n\
             Recipient Details:\n\
             - Name: {recipient}\n\
             - Company: {recipient_company}\n\
             - Industry: {industry}\n\n\
             Email Instructions:\n\
             - {goal}\n\
             - Keep the tone professional, confident, and highly personalized.\n\
             - Sign the email as {name}.\n\
             - {FORMAT_RULES}",
            name = self.profile.sender_name,
            company = self.profile.sender_company,
            recipient = contact.name,
            recipient_company = contact.company_name,
            industry = contact.industry.as_deref().unwrap_or("unknown"),
        )
    }

    fn meeting_prompt(&self, contact: &Contact) -> String {
        let booking = if self.profile.booking_link.is_some() {
            format!("- Prompt them to book a meeting using the placeholder {BOOKING_LINK_PLACEHOLDER}.")
        } else {
            "- Ask them to reply with a few times that suit them for a short call.".to_string()
        };
        format!(
            "You are {name} from {company}. A potential client has replied positively to your outreach.\n\
             Draft a brief, friendly, and professional email to them to book a meeting.\n\n\
             Recipient Name: {recipient}\n\n\
             Instructions:\n\
             - Thank them for their reply.\n\
             {booking}\n\
             - Keep it concise and professional.\n\
             - {FORMAT_RULES}",
            name = self.profile.sender_name,
            company = self.profile.sender_company,
            recipient = contact.name,
        )
    }

    async fn complete(&self, prompt: String, temperature: f32) -> Result<String, GenerationError> {
        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_temperature(temperature)
            .with_max_tokens(self.max_tokens);
        let response = self.llm.complete(request).await?;
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "LLM completion"
        );
        Ok(response.content)
    }

    fn fill_booking_link(&self, body: String) -> String {
        match self.profile.booking_link {
            Some(ref link) => body.replace(BOOKING_LINK_PLACEHOLDER, link),
            None => body,
        }
    }
}

/// Reduce raw model output to a bare industry label.
fn clean_industry(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .trim_start_matches(|c: char| c == '*' || c.is_whitespace())
        .trim_end_matches(|c: char| c == '*' || c == '.' || c.is_whitespace())
        .replace(['"', '\'', '`'], "")
        .trim()
        .to_string()
}

#[async_trait]
impl ContentGenerator for LlmContentGenerator {
    async fn classify_industry(
        &self,
        company_name: &str,
        company_url: Option<&str>,
    ) -> Result<String, GenerationError> {
        let prompt = format!(
            "Analyze the following company and determine its primary industry.\n\
             Company Name: {company_name}\n\
             Company URL: {url}\n\n\
             Provide only the industry name (e.g., \"FinTech\", \"Digital Marketing\", \"Healthcare AI\").",
            url = company_url.unwrap_or("unknown"),
        );

        let raw = self.complete(prompt, CLASSIFY_TEMPERATURE).await?;
        let industry = clean_industry(&raw);
        if industry.is_empty() {
            return Err(GenerationError::Empty {
                what: "industry".to_string(),
            });
        }

        info!(company = company_name, industry = %industry, "Company classified");
        Ok(industry)
    }

    async fn generate(
        &self,
        contact: &Contact,
        stage: Stage,
    ) -> Result<EmailContent, GenerationError> {
        let (prompt, temperature) = match stage {
            Stage::MeetingRequest => (self.meeting_prompt(contact), MEETING_TEMPERATURE),
            _ => (self.outreach_prompt(contact, stage), OUTREACH_TEMPERATURE),
        };

        let raw = self.complete(prompt, temperature).await?;
        let mut email = parse_subject_body(&raw, stage)?;
        if stage == Stage::MeetingRequest {
            email.body = self.fill_booking_link(email.body);
        }

        debug!(contact_id = contact.id, stage = %stage, subject = %email.subject, "Email generated");
        Ok(email)
    }
}
