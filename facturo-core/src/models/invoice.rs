use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::billing::calculator::{checked_product, checked_sum, round_currency};
use crate::error::{BillingError, Result};
use crate::models::period::Period;
use crate::models::prestation::Prestation;

/// Invoice status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Unpaid,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker set on an invoice superseded by a rectification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceMarker {
    #[serde(rename = "RECTIFIEE")]
    Rectifiee,
}

/// Rates applied when computing invoice amounts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxRates {
    /// Statutory social-contribution withholding, fraction of gross
    pub urssaf_rate: Decimal,
    /// VAT rate; zero under the franchise regime
    pub tva_rate: Decimal,
}

/// Monetary totals of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Amounts {
    #[serde(rename = "montantHT")]
    pub montant_ht: Decimal,
    #[serde(rename = "taxeURSSAF")]
    pub taxe_urssaf: Decimal,
    pub montant_net: Decimal,
    #[serde(rename = "montantTTC")]
    pub montant_ttc: Decimal,
}

impl Amounts {
    pub fn from_gross(montant_ht: Decimal, rates: &TaxRates) -> Result<Self> {
        let montant_ht = round_currency(montant_ht);
        let taxe_urssaf = round_currency(checked_product(montant_ht, rates.urssaf_rate)?);
        Ok(Self {
            montant_ht,
            taxe_urssaf,
            montant_net: montant_ht - taxe_urssaf,
            montant_ttc: round_currency(checked_product(montant_ht, Decimal::ONE + rates.tva_rate)?),
        })
    }

    /// Gross amount is the sum of the persisted line totals.
    pub fn from_prestations(prestations: &[Prestation], rates: &TaxRates) -> Result<Self> {
        let montant_ht = checked_sum(prestations.iter().map(|p| p.total))?;
        Self::from_gross(montant_ht, rates)
    }
}

/// Accepted payment and refund methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Virement,
    Cheque,
    Especes,
    Carte,
    Autre,
}

impl FromStr for PaymentMethod {
    type Err = BillingError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "virement" => Ok(PaymentMethod::Virement),
            "cheque" => Ok(PaymentMethod::Cheque),
            "especes" => Ok(PaymentMethod::Especes),
            "carte" => Ok(PaymentMethod::Carte),
            "autre" => Ok(PaymentMethod::Autre),
            other => Err(BillingError::validation(
                "methodePaiement",
                format!("unknown payment method '{}'", other),
            )),
        }
    }
}

/// Entry of the payment history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub date: NaiveDate,
    pub montant: Decimal,
    pub methode: PaymentMethod,
}

/// Entry of the reminder history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub date: NaiveDate,
    /// 1 for the first reminder, then escalating
    pub niveau: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cancellation {
    pub motif: String,
    pub date: NaiveDate,
}

/// Credit note attached to a paid invoice.
///
/// Either fully present on the invoice or absent; never partially built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Avoir {
    /// Number in the avoir series, independent from invoice numbers
    pub numero: i64,
    pub date: NaiveDate,
    pub montant: Decimal,
    pub motif: String,
    pub remboursement: bool,
    /// Present iff `remboursement`
    pub methode_paiement: Option<PaymentMethod>,
    pub date_remboursement: Option<NaiveDate>,
}

/// Closed set of legal grounds for a rectification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MotifLegal {
    ErreurMontant,
    ErreurTva,
    ErreurClient,
    PrestationModifiee,
    RemiseExceptionnelle,
    Autre,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiffKind {
    Modifiee,
    Ajoutee,
    Supprimee,
}

/// Before/after value of one changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub field: String,
    pub before: Value,
    pub after: Value,
}

/// Audit record for one prestation touched by a rectification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrestationDiff {
    pub kind: DiffKind,
    pub prestation_id: Uuid,
    pub before: Option<Prestation>,
    pub after: Option<Prestation>,
    pub changes: Vec<FieldChange>,
}

/// Embedded on a rectificative invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RectificationInfo {
    pub original_invoice_id: Uuid,
    pub original_invoice_number: i64,
    pub motif_legal: MotifLegal,
    pub details_motif: Option<String>,
    pub prestations_modifiees: Vec<PrestationDiff>,
    #[serde(rename = "differenceMontantHT")]
    pub difference_montant_ht: Decimal,
    #[serde(rename = "differenceTaxeURSSAF")]
    pub difference_taxe_urssaf: Decimal,
    pub difference_montant_net: Decimal,
    #[serde(rename = "differenceMontantTTC")]
    pub difference_montant_ttc: Decimal,
}

/// Invoice ("facture") with its full legal lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// Unique identifier for the invoice
    pub id: Uuid,

    /// Sequential number, never reused within an account
    pub invoice_number: i64,

    pub client_id: Uuid,

    /// Month the prestations were selected from
    pub period: Period,

    /// Snapshot frozen at creation
    pub prestations: Vec<Prestation>,

    #[serde(alias = "dateEdition")]
    pub date_facture: NaiveDate,

    /// Due date for payment
    pub date_echeance: NaiveDate,

    pub rates: TaxRates,

    #[serde(flatten)]
    pub amounts: Amounts,

    pub status: InvoiceStatus,
    pub is_sent_to_client: bool,

    /// True once the invoice is legally immutable
    pub locked: bool,

    pub date_envoi: Option<NaiveDate>,
    pub date_paiement: Option<NaiveDate>,

    /// Present only on rectificative invoices
    pub rectification_info: Option<RectificationInfo>,

    /// `RECTIFIEE` once superseded
    pub statut: Option<InvoiceMarker>,

    /// Rectificative invoices derived from this one, in creation order
    #[serde(default)]
    pub rectifications: Vec<Uuid>,

    pub avoir: Option<Avoir>,

    #[serde(default)]
    pub historique_paiements: Vec<Payment>,

    #[serde(default)]
    pub rappels: Vec<Reminder>,

    pub cancellation: Option<Cancellation>,

    /// Source invoice when created by duplication
    pub duplicated_from: Option<Uuid>,

    /// Optimistic-concurrency counter, bumped on every committed change
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn is_rectification(&self) -> bool {
        self.rectification_info.is_some()
    }

    pub fn is_superseded(&self) -> bool {
        self.statut == Some(InvoiceMarker::Rectifiee)
    }

    /// Whether this invoice occupies its client's period for generation.
    /// Cancelled, rectificative and duplicated invoices do not.
    pub fn claims_period(&self) -> bool {
        self.status != InvoiceStatus::Cancelled
            && !self.is_rectification()
            && self.duplicated_from.is_none()
    }

    pub fn has_avoir(&self) -> bool {
        self.avoir.is_some()
    }

    /// Net amount once the credit note is deducted. Derived, never stored.
    pub fn net_after_avoir(&self) -> Decimal {
        match &self.avoir {
            Some(avoir) => self.amounts.montant_net - avoir.montant,
            None => self.amounts.montant_net,
        }
    }

    pub fn is_past_due(&self, today: NaiveDate) -> bool {
        today > self.date_echeance
    }

    /// Immutable snapshot handed to document rendering.
    pub fn document(&self) -> InvoiceDocument {
        InvoiceDocument {
            invoice: self.clone(),
            is_rectification: self.is_rectification(),
            net_after_avoir: self.net_after_avoir(),
        }
    }
}

/// Finalized data for a rendered invoice or credit note.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceDocument {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub is_rectification: bool,
    pub net_after_avoir: Decimal,
}
