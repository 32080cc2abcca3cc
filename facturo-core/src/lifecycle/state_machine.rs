use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BillingError;
use crate::models::invoice::{Invoice, InvoiceStatus};

/// Event requested against an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceEvent {
    MarkAsSent,
    Delete,
    RecordPayment,
    ReminderElapsed,
    Cancel,
    Rectify,
    CreateAvoir,
    Duplicate,
}

impl fmt::Display for InvoiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvoiceEvent::MarkAsSent => write!(f, "mark_as_sent"),
            InvoiceEvent::Delete => write!(f, "delete"),
            InvoiceEvent::RecordPayment => write!(f, "record_payment"),
            InvoiceEvent::ReminderElapsed => write!(f, "reminder_elapsed"),
            InvoiceEvent::Cancel => write!(f, "cancel"),
            InvoiceEvent::Rectify => write!(f, "rectify"),
            InvoiceEvent::CreateAvoir => write!(f, "create_avoir"),
            InvoiceEvent::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// Where a permitted event leads the invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The invoice stays and takes this status
    Status(InvoiceStatus),
    /// The invoice is removed
    Removed,
    /// A new invoice is derived; the source keeps its status
    Derived,
}

/// Side effect the caller must apply together with the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Set `isSentToClient`; the invoice becomes undeletable
    MarkSent,
    /// Detach the invoice's prestations
    DetachPrestations,
    /// Append to the payment history and set the payment date
    AppendPayment,
    /// Append to the reminder history
    AppendReminder,
    /// Record the cancellation motif
    RecordCancellation,
    /// Lock the original and mark it `RECTIFIEE`
    LockOriginal,
    /// Attach the credit note
    AttachAvoir,
    /// Copy the prestation snapshot into a new draft
    CopySnapshot,
}

/// Trait for state transitions in the invoice lifecycle.
///
/// Implementations decide whether an event is allowed for the current
/// state of an invoice and what it leads to, without mutating anything.
pub trait Transition {
    /// Determines the target and side effect of `event`.
    ///
    /// # Arguments
    ///
    /// * `invoice` - Current snapshot of the invoice
    /// * `event` - Requested event
    /// * `today` - Reference date for due-date guards
    ///
    /// # Returns
    ///
    /// Returns a tuple of (target, side_effect), or
    /// `InvalidStateTransition` when a guard fails.
    fn transition(
        invoice: &Invoice,
        event: InvoiceEvent,
        today: NaiveDate,
    ) -> Result<(Target, SideEffect), BillingError>;

    /// Gets the initial status for a new invoice.
    fn initial_state() -> InvoiceStatus {
        InvoiceStatus::Draft
    }
}

/// Legal lifecycle of an invoice:
/// - draft -> unpaid (sent), or removed while never sent
/// - unpaid/overdue -> paid, overdue, cancelled, or rectified
/// - paid -> paid with a credit note attached
/// - any -> duplicated into a new draft
pub struct InvoiceStateMachine;

fn deny(invoice: &Invoice, event: InvoiceEvent, reason: &'static str) -> BillingError {
    BillingError::InvalidStateTransition {
        invoice_number: invoice.invoice_number,
        status: invoice.status.to_string(),
        event: event.to_string(),
        reason,
    }
}

fn is_open(status: InvoiceStatus) -> bool {
    matches!(status, InvoiceStatus::Unpaid | InvoiceStatus::Overdue)
}

impl Transition for InvoiceStateMachine {
    fn transition(
        invoice: &Invoice,
        event: InvoiceEvent,
        today: NaiveDate,
    ) -> Result<(Target, SideEffect), BillingError> {
        if event == InvoiceEvent::Duplicate {
            return Ok((Target::Derived, SideEffect::CopySnapshot));
        }

        if invoice.locked {
            return Err(deny(invoice, event, "invoice is locked"));
        }

        match event {
            InvoiceEvent::MarkAsSent => {
                if invoice.status != InvoiceStatus::Draft || invoice.is_sent_to_client {
                    return Err(deny(invoice, event, "only drafts can be sent"));
                }
                Ok((Target::Status(InvoiceStatus::Unpaid), SideEffect::MarkSent))
            }
            InvoiceEvent::Delete => {
                if invoice.is_sent_to_client {
                    return Err(deny(
                        invoice,
                        event,
                        "sent invoices can only be cancelled, rectified or credited",
                    ));
                }
                if invoice.status != InvoiceStatus::Draft {
                    return Err(deny(invoice, event, "only drafts can be deleted"));
                }
                if invoice.is_rectification() {
                    return Err(deny(invoice, event, "rectificative invoices belong to an audit chain"));
                }
                Ok((Target::Removed, SideEffect::DetachPrestations))
            }
            InvoiceEvent::RecordPayment => {
                if !is_open(invoice.status) || !invoice.is_sent_to_client {
                    return Err(deny(invoice, event, "only sent, unpaid invoices can be paid"));
                }
                Ok((Target::Status(InvoiceStatus::Paid), SideEffect::AppendPayment))
            }
            InvoiceEvent::ReminderElapsed => {
                if !is_open(invoice.status) || !invoice.is_sent_to_client {
                    return Err(deny(invoice, event, "only sent, unpaid invoices can become overdue"));
                }
                if !invoice.is_past_due(today) {
                    return Err(deny(invoice, event, "due date has not passed"));
                }
                Ok((Target::Status(InvoiceStatus::Overdue), SideEffect::AppendReminder))
            }
            InvoiceEvent::Cancel => {
                if !is_open(invoice.status) || !invoice.is_sent_to_client {
                    return Err(deny(invoice, event, "only sent, unpaid invoices can be cancelled"));
                }
                Ok((Target::Status(InvoiceStatus::Cancelled), SideEffect::RecordCancellation))
            }
            InvoiceEvent::Rectify => {
                if !is_open(invoice.status) || !invoice.is_sent_to_client {
                    return Err(deny(invoice, event, "only sent, unpaid invoices can be rectified"));
                }
                Ok((Target::Derived, SideEffect::LockOriginal))
            }
            InvoiceEvent::CreateAvoir => {
                if invoice.status != InvoiceStatus::Paid {
                    return Err(deny(invoice, event, "credit notes apply to paid invoices"));
                }
                if invoice.has_avoir() {
                    return Err(deny(invoice, event, "invoice already has a credit note"));
                }
                Ok((Target::Status(InvoiceStatus::Paid), SideEffect::AttachAvoir))
            }
            InvoiceEvent::Duplicate => Ok((Target::Derived, SideEffect::CopySnapshot)),
        }
    }
}
