//! Bulk contact import.

use tracing::{debug, warn};

use crate::contacts::model::NewContact;
use crate::error::{DatabaseError, Result};
use crate::store::ContactStore;

/// Counts reported by [`import_contacts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    /// Already present by email.
    pub skipped: usize,
    /// Failed boundary validation or a uniqueness check.
    pub rejected: usize,
}

/// Insert `contacts` that are not already stored.
///
/// Invalid records are counted and logged, not fatal. Any other store failure
/// aborts the import.
pub async fn import_contacts(
    store: &dyn ContactStore,
    contacts: &[NewContact],
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for contact in contacts {
        if store.find_by_email(contact.email.trim()).await?.is_some() {
            summary.skipped += 1;
            continue;
        }
        match store.insert_contact(contact).await {
            Ok(id) => {
                debug!(contact_id = id, email = %contact.email, "Contact imported");
                summary.imported += 1;
            }
            Err(DatabaseError::Constraint(reason)) => {
                warn!(email = %contact.email, %reason, "Contact rejected");
                summary.rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(summary)
}
