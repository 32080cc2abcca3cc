use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::AccountContext;

/// Named result of an engine operation, signalled once it is committed
/// (or rejected). How it is surfaced to the user is up to the notifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    InvoiceGenerated {
        invoice_id: Uuid,
        invoice_number: i64,
    },
    InvoiceSent {
        invoice_number: i64,
    },
    InvoiceDeleted {
        invoice_number: i64,
    },
    PaymentRecorded {
        invoice_number: i64,
        montant: Decimal,
    },
    ReminderRecorded {
        invoice_number: i64,
        niveau: u32,
    },
    InvoiceCancelled {
        invoice_number: i64,
    },
    InvoiceRectified {
        original_number: i64,
        rectification_number: i64,
    },
    AvoirCreated {
        invoice_number: i64,
        numero: i64,
        montant: Decimal,
    },
    InvoiceDuplicated {
        source_number: i64,
        invoice_number: i64,
    },
    Rejected {
        operation: &'static str,
        kind: ErrorKind,
    },
}

/// Receives outcomes from [`crate::service::BillingService`].
pub trait Notifier: Send + Sync {
    fn notify(&self, account: &AccountContext, outcome: &Outcome);
}

/// Writes every outcome to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, account: &AccountContext, outcome: &Outcome) {
        match outcome {
            Outcome::Rejected { operation, kind } => {
                warn!(account_id = %account.account_id, operation, ?kind, "Operation rejected");
            }
            other => {
                info!(account_id = %account.account_id, outcome = ?other, "Billing outcome");
            }
        }
    }
}
