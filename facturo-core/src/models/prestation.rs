use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::calculator;
use crate::error::{BillingError, Result};

/// Unit the caller used to express a duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Minutes,
    Hours,
    Days,
}

/// Billing terms of a persisted prestation.
///
/// Hourly work always carries `durationUnit = hours`; the hour count is
/// derived from the canonical minute duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "billingType", rename_all = "lowercase")]
pub enum Billing {
    #[serde(rename_all = "camelCase")]
    Hourly { hourly_rate: Decimal },

    #[serde(rename_all = "camelCase")]
    Fixed {
        fixed_price: Decimal,
        quantity: u32,
        duration_unit: DurationUnit,
    },
}

/// A billable unit of work.
///
/// Once `invoice_id` is set the prestation is frozen: every caller must go
/// through [`Prestation::ensure_mutable`] before editing or deleting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prestation {
    pub id: Uuid,
    pub client_id: Uuid,
    pub date: NaiveDate,
    pub description: String,

    #[serde(flatten)]
    pub billing: Billing,

    /// Canonical duration in minutes
    pub duration: i64,

    /// Line amount, rounded to cents at persistence
    pub total: Decimal,

    /// Owning invoice, if any
    pub invoice_id: Option<Uuid>,

    /// Whether the owning invoice has been paid
    #[serde(default)]
    pub invoice_paid: bool,
}

impl Prestation {
    pub fn duration_unit(&self) -> DurationUnit {
        match &self.billing {
            Billing::Hourly { .. } => DurationUnit::Hours,
            Billing::Fixed { duration_unit, .. } => *duration_unit,
        }
    }

    /// Fractional hours represented by the duration.
    pub fn hours(&self) -> Decimal {
        Decimal::from(self.duration) / Decimal::from(60)
    }

    /// Amount before rounding, used when summing several lines.
    pub fn raw_total(&self) -> Result<Decimal> {
        calculator::amount(&self.billing, self.duration)
    }

    pub fn is_invoiced(&self) -> bool {
        self.invoice_id.is_some()
    }

    /// Rejects any mutation of a prestation that already belongs to an invoice.
    pub fn ensure_mutable(&self) -> Result<()> {
        match self.invoice_id {
            Some(invoice_id) => Err(BillingError::ImmutablePrestation {
                prestation_id: self.id,
                invoice_id,
            }),
            None => Ok(()),
        }
    }

    /// Rebuilds the form input that produces this prestation.
    pub fn to_draft(&self) -> PrestationDraft {
        let billing = match &self.billing {
            Billing::Hourly { hourly_rate } => BillingInput::Hourly {
                hours: Some(Decimal::from(self.duration / 60)),
                minutes: Some(Decimal::from(self.duration % 60)),
                hourly_rate: Some(*hourly_rate),
            },
            Billing::Fixed {
                fixed_price,
                quantity,
                duration_unit,
            } => {
                let (value1, value2) = match duration_unit {
                    DurationUnit::Minutes => (Decimal::from(self.duration), None),
                    DurationUnit::Hours => (
                        Decimal::from(self.duration / 60),
                        Some(Decimal::from(self.duration % 60)),
                    ),
                    DurationUnit::Days => (
                        Decimal::from(self.duration) / Decimal::from(calculator::MINUTES_PER_DAY),
                        None,
                    ),
                };
                BillingInput::Fixed {
                    fixed_price: Some(*fixed_price),
                    quantity: Some(*quantity),
                    duration_unit: *duration_unit,
                    value1: Some(value1),
                    value2,
                }
            }
        };

        PrestationDraft {
            client_id: self.client_id,
            date: self.date,
            description: self.description.clone(),
            billing,
        }
    }
}

/// Raw billing form state. Missing numeric fields count as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "billingType", rename_all = "lowercase")]
pub enum BillingInput {
    #[serde(rename_all = "camelCase")]
    Hourly {
        hours: Option<Decimal>,
        minutes: Option<Decimal>,
        hourly_rate: Option<Decimal>,
    },

    #[serde(rename_all = "camelCase")]
    Fixed {
        fixed_price: Option<Decimal>,
        quantity: Option<u32>,
        duration_unit: DurationUnit,
        value1: Option<Decimal>,
        value2: Option<Decimal>,
    },
}

/// Prestation creation/update request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrestationDraft {
    pub client_id: Uuid,
    pub date: NaiveDate,
    pub description: String,

    #[serde(flatten)]
    pub billing: BillingInput,
}

impl PrestationDraft {
    /// Normalizes the draft into a standalone prestation.
    pub fn into_prestation(self, id: Uuid) -> Result<Prestation> {
        let description = self.description.trim().to_string();
        if description.is_empty() {
            return Err(BillingError::validation(
                "description",
                "a prestation needs a description",
            ));
        }

        let computed = calculator::compute(&self.billing)?;

        Ok(Prestation {
            id,
            client_id: self.client_id,
            date: self.date,
            description,
            billing: computed.billing,
            duration: computed.duration,
            total: calculator::round_currency(computed.raw_total),
            invoice_id: None,
            invoice_paid: false,
        })
    }
}
