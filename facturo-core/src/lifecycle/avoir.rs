use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::billing::calculator::round_currency;
use crate::error::{BillingError, Result};
use crate::lifecycle::state_machine::{InvoiceEvent, InvoiceStateMachine, Transition};
use crate::models::invoice::{Avoir, Invoice, PaymentMethod};

/// Credit note creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvoirRequest {
    pub montant: Option<Decimal>,
    pub motif: String,
    #[serde(default)]
    pub remboursement: bool,
    /// One of virement, cheque, especes, carte, autre; required for refunds
    pub methode_paiement: Option<String>,
    /// Defaults to the creation date for refunds
    pub date_remboursement: Option<NaiveDate>,
}

/// A validated credit note waiting for its number.
#[derive(Debug, Clone, PartialEq)]
pub struct AvoirPlan {
    montant: Decimal,
    motif: String,
    refund: Option<(PaymentMethod, NaiveDate)>,
    date: NaiveDate,
}

impl AvoirPlan {
    /// Checks preconditions and validates the request, first failure wins:
    /// invoice state, motif, positive amount, amount within the gross
    /// amount, refund method.
    pub fn prepare(invoice: &Invoice, request: AvoirRequest, today: NaiveDate) -> Result<Self> {
        InvoiceStateMachine::transition(invoice, InvoiceEvent::CreateAvoir, today)?;

        let motif = request.motif.trim();
        if motif.is_empty() {
            return Err(BillingError::validation("motif", "a credit note needs a motif"));
        }

        let montant = match request.montant {
            Some(m) if m > Decimal::ZERO => round_currency(m),
            _ => {
                return Err(BillingError::validation(
                    "montant",
                    "amount must be a positive number",
                ))
            }
        };

        if montant > invoice.amounts.montant_ht {
            return Err(BillingError::AmountExceedsOriginal {
                montant,
                montant_ht: invoice.amounts.montant_ht,
            });
        }

        let refund = if request.remboursement {
            let method = request
                .methode_paiement
                .as_deref()
                .ok_or_else(|| {
                    BillingError::validation("methodePaiement", "a refund needs a payment method")
                })?
                .parse::<PaymentMethod>()?;
            Some((method, request.date_remboursement.unwrap_or(today)))
        } else {
            None
        };

        Ok(Self {
            montant,
            motif: motif.to_string(),
            refund,
            date: today,
        })
    }

    /// Attaches the credit note under `numero`. Amounts of the invoice are
    /// left untouched.
    pub fn attach(self, invoice: &mut Invoice, numero: i64, now: DateTime<Utc>) -> Avoir {
        let avoir = Avoir {
            numero,
            date: self.date,
            montant: self.montant,
            motif: self.motif,
            remboursement: self.refund.is_some(),
            methode_paiement: self.refund.map(|(method, _)| method),
            date_remboursement: self.refund.map(|(_, date)| date),
        };
        invoice.avoir = Some(avoir.clone());
        invoice.updated_at = now;
        avoir
    }
}
