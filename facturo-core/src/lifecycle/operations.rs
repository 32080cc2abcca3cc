use chrono::{DateTime, Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, Result};
use crate::lifecycle::state_machine::{InvoiceEvent, InvoiceStateMachine, Target, Transition};
use crate::models::invoice::{
    Amounts, Cancellation, Invoice, InvoiceStatus, Payment, PaymentMethod, Reminder,
};
use crate::models::period::Period;
use crate::models::prestation::Prestation;

/// Payment recording request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// Defaults to today
    pub date: Option<NaiveDate>,
    /// Defaults to the amount due (TTC)
    pub montant: Option<Decimal>,
    pub methode: PaymentMethod,
}

pub(crate) fn due_date(date_facture: NaiveDate, config: &BillingConfig) -> Result<NaiveDate> {
    date_facture
        .checked_add_days(Days::new(u64::from(config.payment_term_days)))
        .ok_or_else(|| BillingError::validation("dateEcheance", "due date out of range"))
}

/// Applies `event` to `invoice`, returning the new status it leads to.
fn advance(invoice: &Invoice, event: InvoiceEvent, today: NaiveDate) -> Result<InvoiceStatus> {
    match InvoiceStateMachine::transition(invoice, event, today)? {
        (Target::Status(status), _) => Ok(status),
        (target, _) => Err(BillingError::Internal(anyhow::anyhow!(
            "{} unexpectedly led to {:?}",
            event,
            target
        ))),
    }
}

/// Builds a draft invoice owning `prestations`.
///
/// The prestations are re-pointed at the new invoice; the caller persists
/// invoice and attachment as one unit.
#[allow(clippy::too_many_arguments)]
pub fn new_draft(
    id: Uuid,
    invoice_number: i64,
    client_id: Uuid,
    period: Period,
    prestations: Vec<Prestation>,
    date_facture: NaiveDate,
    config: &BillingConfig,
    now: DateTime<Utc>,
) -> Result<Invoice> {
    if prestations.is_empty() {
        return Err(BillingError::NoPrestationsFound { client_id, period });
    }

    let prestations: Vec<Prestation> = prestations
        .into_iter()
        .map(|mut p| {
            p.invoice_id = Some(id);
            p.invoice_paid = false;
            p
        })
        .collect();

    let amounts = Amounts::from_prestations(&prestations, &config.rates)?;

    Ok(Invoice {
        id,
        invoice_number,
        client_id,
        period,
        prestations,
        date_facture,
        date_echeance: due_date(date_facture, config)?,
        rates: config.rates,
        amounts,
        status: InvoiceStateMachine::initial_state(),
        is_sent_to_client: false,
        locked: false,
        date_envoi: None,
        date_paiement: None,
        rectification_info: None,
        statut: None,
        rectifications: Vec::new(),
        avoir: None,
        historique_paiements: Vec::new(),
        rappels: Vec::new(),
        cancellation: None,
        duplicated_from: None,
        version: 0,
        created_at: now,
        updated_at: now,
    })
}

/// draft -> unpaid; the invoice becomes undeletable.
pub fn mark_as_sent(invoice: &mut Invoice, today: NaiveDate, now: DateTime<Utc>) -> Result<()> {
    let status = advance(invoice, InvoiceEvent::MarkAsSent, today)?;
    invoice.status = status;
    invoice.is_sent_to_client = true;
    invoice.date_envoi = Some(today);
    invoice.updated_at = now;
    info!(invoice_number = invoice.invoice_number, "Invoice marked as sent");
    Ok(())
}

/// Checks that `invoice` may be removed. Deletion itself, with prestation
/// detachment, is done by the store.
pub fn check_delete(invoice: &Invoice, today: NaiveDate) -> Result<()> {
    match InvoiceStateMachine::transition(invoice, InvoiceEvent::Delete, today)? {
        (Target::Removed, _) => Ok(()),
        (target, _) => Err(BillingError::Internal(anyhow::anyhow!(
            "delete unexpectedly led to {:?}",
            target
        ))),
    }
}

/// unpaid/overdue -> paid.
pub fn record_payment(
    invoice: &mut Invoice,
    request: PaymentRequest,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Payment> {
    let status = advance(invoice, InvoiceEvent::RecordPayment, today)?;

    let montant = request.montant.unwrap_or(invoice.amounts.montant_ttc);
    if montant <= Decimal::ZERO {
        return Err(BillingError::validation("montant", "payment must be positive"));
    }

    let payment = Payment {
        date: request.date.unwrap_or(today),
        montant,
        methode: request.methode,
    };

    invoice.status = status;
    invoice.date_paiement = Some(payment.date);
    invoice.historique_paiements.push(payment.clone());
    for prestation in &mut invoice.prestations {
        prestation.invoice_paid = true;
    }
    invoice.updated_at = now;
    Ok(payment)
}

/// unpaid/overdue -> overdue, appending an escalating reminder.
pub fn record_reminder(invoice: &mut Invoice, today: NaiveDate, now: DateTime<Utc>) -> Result<Reminder> {
    let status = advance(invoice, InvoiceEvent::ReminderElapsed, today)?;

    let reminder = Reminder {
        date: today,
        niveau: invoice.rappels.len() as u32 + 1,
    };
    invoice.status = status;
    invoice.rappels.push(reminder.clone());
    invoice.updated_at = now;
    Ok(reminder)
}

/// unpaid/overdue -> cancelled. Irreversible.
pub fn cancel(invoice: &mut Invoice, motif: &str, today: NaiveDate, now: DateTime<Utc>) -> Result<()> {
    let status = advance(invoice, InvoiceEvent::Cancel, today)?;

    let motif = motif.trim();
    if motif.is_empty() {
        return Err(BillingError::validation("motif", "a cancellation needs a motif"));
    }

    invoice.status = status;
    invoice.cancellation = Some(Cancellation {
        motif: motif.to_string(),
        date: today,
    });
    invoice.updated_at = now;
    Ok(())
}

/// Copies the prestation snapshot of `source` into a new draft.
///
/// The copied lines get fresh ids and belong to the new invoice.
pub fn duplicate(
    source: &Invoice,
    id: Uuid,
    invoice_number: i64,
    today: NaiveDate,
    config: &BillingConfig,
    now: DateTime<Utc>,
) -> Result<Invoice> {
    InvoiceStateMachine::transition(source, InvoiceEvent::Duplicate, today)?;

    let prestations = source
        .prestations
        .iter()
        .map(|p| Prestation {
            id: Uuid::new_v4(),
            ..p.clone()
        })
        .collect();

    let mut copy = new_draft(
        id,
        invoice_number,
        source.client_id,
        source.period,
        prestations,
        today,
        config,
        now,
    )?;
    copy.duplicated_from = Some(source.id);
    Ok(copy)
}
