//! SMTP + IMAP mail transport.
//!
//! Outbound mail goes through lettre's blocking SMTP transport. Reply search
//! speaks raw IMAP over rustls: `EXAMINE` keeps the mailbox read-only and
//! `BODY.PEEK[]` leaves `\Seen` flags alone. Both run on blocking threads.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::config::EmailConfig;
use crate::error::TransportError;
use crate::mail::reply::{self, FoundReply, ReplyCandidate};
use crate::mail::text;
use crate::mail::{MailTransport, SendConfirmation};

/// Socket timeout for IMAP reads and writes.
const IMAP_IO_TIMEOUT: Duration = Duration::from_secs(30);

const SMTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Newest messages fetched per search.
const MAX_CANDIDATES: usize = 20;

/// Error type for IMAP operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// SMTP/IMAP implementation of `MailTransport`.
pub struct EmailTransport {
    config: EmailConfig,
}

impl EmailTransport {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    /// Build a plain-text message from the configured sender.
    fn build_message(&self, to: &str, subject: &str, body: &str) -> Result<Message, TransportError> {
        let from = self
            .config
            .from_address
            .parse::<Mailbox>()
            .map_err(|e| TransportError::InvalidAddress {
                address: self.config.from_address.clone(),
                reason: format!("{e}"),
            })?;
        let recipient = to.trim().parse::<Mailbox>().map_err(|e| TransportError::InvalidAddress {
            address: to.to_string(),
            reason: format!("{e}"),
        })?;

        Message::builder()
            .from(from)
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| TransportError::SendFailed {
                to: to.to_string(),
                reason: format!("Failed to build email: {e}"),
            })
    }

    fn smtp_transport(&self) -> Result<SmtpTransport, TransportError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );

        // 465 is implicit TLS; anything else upgrades with STARTTLS.
        let builder = if self.config.smtp_port == 465 {
            SmtpTransport::relay(&self.config.smtp_host)
        } else {
            SmtpTransport::starttls_relay(&self.config.smtp_host)
        }
        .map_err(|e| TransportError::SendFailed {
            to: self.config.smtp_host.clone(),
            reason: format!("SMTP relay error: {e}"),
        })?;

        Ok(builder
            .port(self.config.smtp_port)
            .credentials(creds)
            .timeout(Some(SMTP_TIMEOUT))
            .build())
    }

    /// Run an IMAP search on a blocking thread, returning raw messages newest first.
    async fn search(&self, mailbox: String, criteria: String) -> Result<Vec<Vec<u8>>, TransportError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || search_mailbox(&config, &mailbox, &criteria))
            .await
            .map_err(|e| TransportError::SearchFailed(format!("IMAP task failed: {e}")))?
            .map_err(|e| TransportError::SearchFailed(e.to_string()))
    }
}

#[async_trait]
impl MailTransport for EmailTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        let message = self.build_message(to, subject, body)?;
        let transport = self.smtp_transport()?;

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| TransportError::SendFailed {
                to: to.to_string(),
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| TransportError::SendFailed {
                to: to.to_string(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        info!(to, subject, "Email sent");
        Ok(())
    }

    async fn find_reply(
        &self,
        from: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Option<FoundReply>, TransportError> {
        let raw = self
            .search(self.config.inbox.clone(), search_criteria("FROM", from, after))
            .await?;
        debug!(from, candidates = raw.len(), "Reply search complete");

        let candidates = raw.iter().filter_map(|bytes| parse_candidate(bytes, from));
        Ok(reply::select_reply(candidates, from, after, Utc::now()))
    }

    async fn confirm_sent(
        &self,
        to: &str,
        subject: &str,
        after: DateTime<Utc>,
    ) -> Result<SendConfirmation, TransportError> {
        let Some(mailbox) = self.config.sent_mailbox.clone() else {
            return Ok(SendConfirmation::Unknown);
        };

        let raw = self
            .search(mailbox, search_criteria("TO", to, Some(after)))
            .await?;
        Ok(match_sent(&raw, to, subject, after))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Quote an IMAP string argument.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `FIELD "addr" [SINCE dd-Mon-yyyy]`. SINCE is date-granular and uses the
/// server's timezone, so it starts one day before the UTC date; the exact
/// bound is applied after parsing.
fn search_criteria(field: &str, address: &str, after: Option<DateTime<Utc>>) -> String {
    let mut criteria = format!("{field} {}", quote(address.trim()));
    if let Some(after) = after {
        let since = after - chrono::Duration::days(1);
        criteria.push_str(&format!(" SINCE {}", since.format("%d-%b-%Y")));
    }
    criteria
}

/// Size of a `{N}` literal announced at the end of a response line.
fn literal_len(line: &str) -> Option<usize> {
    let line = line.trim_end_matches(['\r', '\n']);
    let inner = line.strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].parse().ok()
}

/// Message sequence numbers from `* SEARCH` lines.
fn parse_search_ids(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|id| id.parse().ok()))
        .collect()
}

fn message_date(parsed: &mail_parser::Message) -> Option<DateTime<Utc>> {
    parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
}

/// Parse a raw message into a reply candidate, preferring the sender that matches `expected_from`.
fn parse_candidate(raw: &[u8], expected_from: &str) -> Option<ReplyCandidate> {
    let parsed = MessageParser::default().parse(raw)?;
    let senders = text::sender_addresses(&parsed);
    let from = senders
        .iter()
        .find(|s| s.eq_ignore_ascii_case(expected_from.trim()))
        .or_else(|| senders.first())?
        .clone();

    Some(ReplyCandidate {
        from,
        date: message_date(&parsed),
        body: text::extract_text(&parsed),
    })
}

/// Look for our own message to `to` with `subject` in raw sent-mailbox messages.
fn match_sent(raw: &[Vec<u8>], to: &str, subject: &str, after: DateTime<Utc>) -> SendConfirmation {
    // Date headers carry whole seconds; the claim timestamp does not.
    let lower = after - chrono::Duration::seconds(1);
    for bytes in raw {
        let Some(parsed) = MessageParser::default().parse(bytes.as_slice()) else {
            continue;
        };
        let to_matches = text::addresses(parsed.to())
            .iter()
            .any(|a| a.eq_ignore_ascii_case(to.trim()));
        let subject_matches = parsed.subject().is_some_and(|s| s.trim() == subject.trim());
        if !(to_matches && subject_matches) {
            continue;
        }
        match message_date(&parsed) {
            Some(date) if date >= lower => return SendConfirmation::Delivered(date),
            Some(_) => continue,
            None => return SendConfirmation::Delivered(after),
        }
    }
    SendConfirmation::NotFound
}

// ── IMAP session ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ImapResponse {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// A logged-in IMAP connection (blocking).
struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    fn connect(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))?;
        tcp.set_read_timeout(Some(IMAP_IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IMAP_IO_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name: rustls::pki_types::ServerName<'static> =
            rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };

        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(format!("Unexpected IMAP greeting: {}", greeting.trim()).into());
        }

        session
            .command(&format!(
                "LOGIN {} {}",
                quote(&config.username),
                quote(config.password.expose_secret())
            ))
            .map_err(|_| -> ImapError { "IMAP login failed".into() })?;

        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match std::io::Read::read(&mut self.tls, &mut byte) {
                Ok(0) => return Err("IMAP connection closed".into()),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_literal(&mut self, len: usize) -> Result<Vec<u8>, ImapError> {
        let mut buf = vec![0u8; len];
        std::io::Read::read_exact(&mut self.tls, &mut buf)?;
        Ok(buf)
    }

    /// Send a tagged command and collect its response, including literals.
    fn command(&mut self, cmd: &str) -> Result<ImapResponse, ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        IoWrite::write_all(&mut self.tls, format!("{tag} {cmd}\r\n").as_bytes())?;
        IoWrite::flush(&mut self.tls)?;

        let tagged = format!("{tag} ");
        let mut response = ImapResponse::default();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_len(&line) {
                let literal = self.read_literal(len)?;
                response.literals.push(literal);
            }
            if let Some(status) = line.strip_prefix(&tagged) {
                if status.starts_with("OK") {
                    response.lines.push(line);
                    return Ok(response);
                }
                return Err(format!("IMAP command failed: {}", status.trim()).into());
            }
            response.lines.push(line);
        }
    }

    fn search(&mut self, criteria: &str) -> Result<Vec<u32>, ImapError> {
        let response = self.command(&format!("SEARCH {criteria}"))?;
        Ok(parse_search_ids(&response.lines))
    }

    fn fetch_raw(&mut self, id: u32) -> Result<Option<Vec<u8>>, ImapError> {
        let response = self.command(&format!("FETCH {id} BODY.PEEK[]"))?;
        Ok(response.literals.into_iter().next())
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Open `mailbox` read-only, search it, and fetch the newest matches.
fn search_mailbox(
    config: &EmailConfig,
    mailbox: &str,
    criteria: &str,
) -> Result<Vec<Vec<u8>>, ImapError> {
    let mut session = ImapSession::connect(config)?;
    session.command(&format!("EXAMINE {}", quote(mailbox)))?;

    let mut ids = session.search(criteria)?;
    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids.truncate(MAX_CANDIDATES);

    let mut messages = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(raw) = session.fetch_raw(id)? {
            messages.push(raw);
        }
    }

    session.logout();
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use secrecy::SecretString;

    use super::*;

    fn config(sent_mailbox: Option<&str>) -> EmailConfig {
        EmailConfig {
            imap_host: "imap.mail.example".to_string(),
            imap_port: 993,
            smtp_host: "smtp.mail.example".to_string(),
            smtp_port: 587,
            username: "grace@hopper.example".to_string(),
            password: SecretString::from("hunter2"),
            from_address: "grace@hopper.example".to_string(),
            inbox: "INBOX".to_string(),
            sent_mailbox: sent_mailbox.map(String::from),
        }
    }

    fn raw_message(from: &str, to: &str, subject: &str, date: &str, body: &str) -> Vec<u8> {
        format!(
            "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nDate: {date}\r\n\r\n{body}\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn quote_escapes() {
        assert_eq!(quote("INBOX"), "\"INBOX\"");
        assert_eq!(quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn criteria_with_and_without_bound() {
        assert_eq!(
            search_criteria("FROM", " ada@engines.example ", None),
            "FROM \"ada@engines.example\""
        );
        let after = Utc.with_ymd_and_hms(2026, 1, 6, 23, 59, 0).unwrap();
        assert_eq!(
            search_criteria("TO", "ada@engines.example", Some(after)),
            "TO \"ada@engines.example\" SINCE 05-Jan-2026"
        );
    }

    #[test]
    fn criteria_bound_covers_servers_behind_utc() {
        // 00:30 UTC on the 1st is still the 31st for a server at UTC-5.
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 0, 30, 0).unwrap();
        assert_eq!(
            search_criteria("FROM", "ada@engines.example", Some(after)),
            "FROM \"ada@engines.example\" SINCE 28-Feb-2026"
        );
    }

    #[test]
    fn literal_length_detection() {
        assert_eq!(literal_len("* 3 FETCH (BODY[] {1234}\r\n"), Some(1234));
        assert_eq!(literal_len("* 3 FETCH (FLAGS (\\Seen))\r\n"), None);
        assert_eq!(literal_len("A4 OK done\r\n"), None);
    }

    #[test]
    fn search_ids_parsed() {
        let lines = vec![
            "* SEARCH 2 5 9\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(parse_search_ids(&lines), vec![2, 5, 9]);
        assert!(parse_search_ids(&["* SEARCH\r\n".to_string()]).is_empty());
    }

    #[test]
    fn candidate_from_raw_message() {
        let raw = raw_message(
            "Ada <ADA@engines.example>",
            "grace@hopper.example",
            "Re: Hello",
            "Tue, 6 Jan 2026 10:00:00 +0200",
            "Yes, let's talk.\r\n> Hi Ada",
        );
        let c = parse_candidate(&raw, "ada@engines.example").unwrap();
        assert_eq!(c.from, "ada@engines.example");
        assert_eq!(c.date, Some(Utc.with_ymd_and_hms(2026, 1, 6, 8, 0, 0).unwrap()));
        assert_eq!(c.body, "Yes, let's talk.");
    }

    #[test]
    fn sent_message_confirmed() {
        let after = Utc.with_ymd_and_hms(2026, 1, 6, 9, 59, 59).unwrap();
        let raw = vec![
            raw_message(
                "grace@hopper.example",
                "ada@engines.example",
                "Other subject",
                "Tue, 6 Jan 2026 10:00:00 +0000",
                "x",
            ),
            raw_message(
                "grace@hopper.example",
                "Ada@Engines.example",
                "Growing Acme",
                "Tue, 6 Jan 2026 10:00:00 +0000",
                "x",
            ),
        ];
        assert_eq!(
            match_sent(&raw, "ada@engines.example", "Growing Acme", after),
            SendConfirmation::Delivered(Utc.with_ymd_and_hms(2026, 1, 6, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn sent_message_before_claim_is_not_a_match() {
        let after = Utc.with_ymd_and_hms(2026, 1, 7, 0, 0, 0).unwrap();
        let raw = vec![raw_message(
            "grace@hopper.example",
            "ada@engines.example",
            "Growing Acme",
            "Tue, 6 Jan 2026 10:00:00 +0000",
            "x",
        )];
        assert_eq!(
            match_sent(&raw, "ada@engines.example", "Growing Acme", after),
            SendConfirmation::NotFound
        );
    }

    #[test]
    fn message_has_headers() {
        let transport = EmailTransport::new(config(None));
        let message = transport
            .build_message("ada@engines.example", "Hello Ada", "Body text")
            .unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Subject: Hello Ada"));
        assert!(formatted.contains("To: ada@engines.example"));
        assert!(formatted.contains("From: grace@hopper.example"));
    }

    #[tokio::test]
    async fn invalid_recipient_rejected_before_connecting() {
        let transport = EmailTransport::new(config(None));
        let err = transport.send("not an address", "S", "B").await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn confirmation_unknown_without_sent_mailbox() {
        let transport = EmailTransport::new(config(None));
        let result = transport
            .confirm_sent("ada@engines.example", "S", Utc::now())
            .await
            .unwrap();
        assert_eq!(result, SendConfirmation::Unknown);
    }
}
