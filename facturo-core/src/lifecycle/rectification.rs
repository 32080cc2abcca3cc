use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, Result};
use crate::lifecycle::operations::due_date;
use crate::lifecycle::state_machine::{InvoiceEvent, InvoiceStateMachine, Transition};
use crate::models::invoice::{
    Amounts, DiffKind, FieldChange, Invoice, InvoiceMarker, MotifLegal, PrestationDiff,
    RectificationInfo,
};
use crate::models::prestation::{BillingInput, Prestation, PrestationDraft};

/// Identity of a line in a replacement prestation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LineRef {
    /// Line carried over from the original invoice
    Existing(Uuid),
    /// Line added by the rectification, with a caller-side temporary id
    New(String),
}

/// One line of the full replacement list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementLine {
    pub line: LineRef,
    pub date: NaiveDate,
    pub description: String,
    #[serde(flatten)]
    pub billing: BillingInput,
}

impl ReplacementLine {
    /// Line reproducing an original prestation unchanged.
    pub fn unchanged(prestation: &Prestation) -> Self {
        let draft = prestation.to_draft();
        Self {
            line: LineRef::Existing(prestation.id),
            date: draft.date,
            description: draft.description,
            billing: draft.billing,
        }
    }
}

/// Rectification request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RectificationRequest {
    pub motif_legal: Option<MotifLegal>,
    /// Mandatory when the motif is `AUTRE`
    pub details_motif: Option<String>,
    /// Corrected client; defaults to the original invoice's client
    pub client_id: Option<Uuid>,
    pub prestations: Vec<ReplacementLine>,
}

/// A validated rectification, ready to receive its invoice number.
#[derive(Debug, Clone)]
pub struct RectificationPlan {
    original: Invoice,
    rectification_id: Uuid,
    client_id: Uuid,
    motif_legal: MotifLegal,
    details_motif: Option<String>,
    prestations: Vec<Prestation>,
    diffs: Vec<PrestationDiff>,
    amounts: Amounts,
    date_facture: NaiveDate,
    date_echeance: NaiveDate,
    config: BillingConfig,
}

/// Both halves of a rectification, to be committed as one unit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RectificationOutcome {
    /// Original, now locked and marked `RECTIFIEE`
    pub original: Invoice,
    pub rectification: Invoice,
}

/// Fields that identify a line rather than describe it.
const IDENTITY_FIELDS: [&str; 3] = ["id", "invoiceId", "invoicePaid"];

fn comparable(prestation: &Prestation) -> Result<Map<String, Value>> {
    let value = serde_json::to_value(prestation)
        .map_err(|e| BillingError::Internal(anyhow::anyhow!("prestation snapshot failed: {}", e)))?;
    let mut fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Err(BillingError::Internal(anyhow::anyhow!(
                "prestation snapshot is not an object: {}",
                other
            )))
        }
    };
    for key in IDENTITY_FIELDS {
        fields.remove(key);
    }
    Ok(fields)
}

/// Field-level changes between two versions of a prestation.
pub fn field_changes(before: &Prestation, after: &Prestation) -> Result<Vec<FieldChange>> {
    let before = comparable(before)?;
    let after = comparable(after)?;
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

    Ok(keys
        .into_iter()
        .filter_map(|key| {
            let old = before.get(key).cloned().unwrap_or(Value::Null);
            let new = after.get(key).cloned().unwrap_or(Value::Null);
            (old != new).then(|| FieldChange {
                field: key.clone(),
                before: old,
                after: new,
            })
        })
        .collect())
}

fn validate_motif(request: &RectificationRequest) -> Result<(MotifLegal, Option<String>)> {
    let motif = request
        .motif_legal
        .ok_or_else(|| BillingError::validation("motifLegal", "a legal motif is required"))?;

    let details = request
        .details_motif
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string);

    if motif == MotifLegal::Autre && details.is_none() {
        return Err(BillingError::validation(
            "detailsMotif",
            "details are required when the motif is AUTRE",
        ));
    }
    Ok((motif, details))
}

impl RectificationPlan {
    /// Validates the request against `original` and computes the new
    /// prestation list, the per-line diff and the amounts.
    ///
    /// Nothing is persisted and no number is allocated here, so every
    /// rejection happens before any write.
    pub fn prepare(
        original: &Invoice,
        request: RectificationRequest,
        rectification_id: Uuid,
        config: &BillingConfig,
        today: NaiveDate,
    ) -> Result<Self> {
        InvoiceStateMachine::transition(original, InvoiceEvent::Rectify, today)?;

        let (motif_legal, details_motif) = validate_motif(&request)?;
        if request.prestations.is_empty() {
            return Err(BillingError::validation(
                "prestations",
                "a rectification must keep at least one prestation",
            ));
        }

        let client_id = request.client_id.unwrap_or(original.client_id);
        let by_id: HashMap<Uuid, &Prestation> =
            original.prestations.iter().map(|p| (p.id, p)).collect();

        let mut seen = HashSet::new();
        let mut prestations = Vec::with_capacity(request.prestations.len());
        let mut diffs = Vec::new();

        for line in request.prestations {
            let draft = PrestationDraft {
                client_id,
                date: line.date,
                description: line.description,
                billing: line.billing,
            };

            match line.line {
                LineRef::Existing(id) => {
                    let before = by_id.get(&id).ok_or_else(|| {
                        BillingError::validation(
                            "prestations",
                            format!("prestation {} is not on invoice {}", id, original.invoice_number),
                        )
                    })?;
                    if !seen.insert(id) {
                        return Err(BillingError::validation(
                            "prestations",
                            format!("prestation {} listed twice", id),
                        ));
                    }

                    let mut after = draft.into_prestation(id)?;
                    after.invoice_id = Some(rectification_id);

                    let changes = field_changes(before, &after)?;
                    if !changes.is_empty() {
                        diffs.push(PrestationDiff {
                            kind: DiffKind::Modifiee,
                            prestation_id: id,
                            before: Some((*before).clone()),
                            after: Some(after.clone()),
                            changes,
                        });
                    }
                    prestations.push(after);
                }
                LineRef::New(_) => {
                    let mut after = draft.into_prestation(Uuid::new_v4())?;
                    after.invoice_id = Some(rectification_id);
                    diffs.push(PrestationDiff {
                        kind: DiffKind::Ajoutee,
                        prestation_id: after.id,
                        before: None,
                        after: Some(after.clone()),
                        changes: Vec::new(),
                    });
                    prestations.push(after);
                }
            }
        }

        for removed in original.prestations.iter().filter(|p| !seen.contains(&p.id)) {
            diffs.push(PrestationDiff {
                kind: DiffKind::Supprimee,
                prestation_id: removed.id,
                before: Some(removed.clone()),
                after: None,
                changes: Vec::new(),
            });
        }

        let amounts = Amounts::from_prestations(&prestations, &config.rates)?;

        Ok(Self {
            original: original.clone(),
            rectification_id,
            client_id,
            motif_legal,
            details_motif,
            prestations,
            diffs,
            amounts,
            date_facture: today,
            date_echeance: due_date(today, config)?,
            config: *config,
        })
    }

    pub fn diffs(&self) -> &[PrestationDiff] {
        &self.diffs
    }

    pub fn amounts(&self) -> &Amounts {
        &self.amounts
    }

    /// Builds the rectificative invoice under `invoice_number` and the
    /// locked original.
    pub fn finalize(self, invoice_number: i64, now: DateTime<Utc>) -> RectificationOutcome {
        let before = self.original.amounts;
        let info = RectificationInfo {
            original_invoice_id: self.original.id,
            original_invoice_number: self.original.invoice_number,
            motif_legal: self.motif_legal,
            details_motif: self.details_motif,
            prestations_modifiees: self.diffs,
            difference_montant_ht: self.amounts.montant_ht - before.montant_ht,
            difference_taxe_urssaf: self.amounts.taxe_urssaf - before.taxe_urssaf,
            difference_montant_net: self.amounts.montant_net - before.montant_net,
            difference_montant_ttc: self.amounts.montant_ttc - before.montant_ttc,
        };

        let rectification = Invoice {
            id: self.rectification_id,
            invoice_number,
            client_id: self.client_id,
            period: self.original.period,
            prestations: self.prestations,
            date_facture: self.date_facture,
            date_echeance: self.date_echeance,
            rates: self.config.rates,
            amounts: self.amounts,
            status: InvoiceStateMachine::initial_state(),
            is_sent_to_client: false,
            locked: false,
            date_envoi: None,
            date_paiement: None,
            rectification_info: Some(info),
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
        };

        let mut original = self.original;
        original.locked = true;
        original.statut = Some(InvoiceMarker::Rectifiee);
        original.rectifications.push(rectification.id);
        original.updated_at = now;

        RectificationOutcome {
            original,
            rectification,
        }
    }
}

/// Full rectification chain containing `start`, root first.
///
/// Walks back to the first original, then forward through every
/// rectification in creation order.
pub fn rectification_chain(invoices: &HashMap<Uuid, Invoice>, start: Uuid) -> Vec<Invoice> {
    let mut root = match invoices.get(&start) {
        Some(invoice) => invoice,
        None => return Vec::new(),
    };

    let mut visited = HashSet::new();
    while let Some(info) = &root.rectification_info {
        if !visited.insert(root.id) {
            break;
        }
        match invoices.get(&info.original_invoice_id) {
            Some(original) => root = original,
            None => break,
        }
    }

    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root.id];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(invoice) = invoices.get(&id) {
            stack.extend(invoice.rectifications.iter().rev().copied());
            chain.push(invoice.clone());
        }
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::state_machine::tests::sample_invoice;
    use crate::models::invoice::InvoiceStatus;
    use crate::models::prestation::DurationUnit;
    use rust_decimal::Decimal;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 20).unwrap()
    }

    fn hourly_line(line: LineRef, day: u32, hours: &str, rate: &str) -> ReplacementLine {
        ReplacementLine {
            line,
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            description: format!("Support {}", day),
            billing: BillingInput::Hourly {
                hours: Some(dec(hours)),
                minutes: None,
                hourly_rate: Some(dec(rate)),
            },
        }
    }

    /// Sent, unpaid invoice #42 with two 2h lines at 75/h (HT 300).
    fn original() -> Invoice {
        let mut invoice = sample_invoice(InvoiceStatus::Unpaid, true);
        let config = BillingConfig::default();
        invoice.prestations = [3, 4]
            .into_iter()
            .map(|day| {
                let line = hourly_line(LineRef::New(String::new()), day, "2", "75");
                let mut p = PrestationDraft {
                    client_id: invoice.client_id,
                    date: line.date,
                    description: line.description,
                    billing: line.billing,
                }
                .into_prestation(Uuid::new_v4())
                .unwrap();
                p.invoice_id = Some(invoice.id);
                p
            })
            .collect();
        invoice.amounts = Amounts::from_prestations(&invoice.prestations, &config.rates).unwrap();
        invoice
    }

    fn request(prestations: Vec<ReplacementLine>) -> RectificationRequest {
        RectificationRequest {
            motif_legal: Some(MotifLegal::ErreurMontant),
            details_motif: None,
            client_id: None,
            prestations,
        }
    }

    #[test]
    fn test_rectification_links_and_locks() {
        let original = original();
        let kept = ReplacementLine::unchanged(&original.prestations[0]);
        let changed = hourly_line(LineRef::Existing(original.prestations[1].id), 4, "3", "75");
        let added = ReplacementLine {
            line: LineRef::New("tmp-1".to_string()),
            date: NaiveDate::from_ymd_opt(2024, 3, 28).unwrap(),
            description: "Forfait déploiement".to_string(),
            billing: BillingInput::Fixed {
                fixed_price: Some(dec("100")),
                quantity: Some(1),
                duration_unit: DurationUnit::Days,
                value1: Some(dec("0.5")),
                value2: None,
            },
        };

        let plan = RectificationPlan::prepare(
            &original,
            request(vec![kept, changed, added]),
            Uuid::new_v4(),
            &BillingConfig::default(),
            today(),
        )
        .unwrap();
        let outcome = plan.finalize(43, Utc::now());

        let info = outcome.rectification.rectification_info.as_ref().unwrap();
        assert_eq!(info.original_invoice_number, 42);
        assert_eq!(info.original_invoice_id, original.id);
        assert_eq!(outcome.rectification.invoice_number, 43);
        assert!(outcome.rectification.is_rectification());
        assert_eq!(outcome.rectification.status, InvoiceStatus::Draft);

        assert!(outcome.original.locked);
        assert_eq!(outcome.original.statut, Some(InvoiceMarker::Rectifiee));
        assert_eq!(outcome.original.rectifications, vec![outcome.rectification.id]);

        let kinds: Vec<DiffKind> = info.prestations_modifiees.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DiffKind::Modifiee, DiffKind::Ajoutee]);

        let modified = &info.prestations_modifiees[0];
        let fields: Vec<&str> = modified.changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["duration", "total"]);

        // 150 + 225 + 100 = 475 against 300
        assert_eq!(outcome.rectification.amounts.montant_ht, dec("475"));
        assert_eq!(info.difference_montant_ht, dec("175"));
        assert_eq!(info.difference_taxe_urssaf, dec("43.05"));
        assert_eq!(info.difference_montant_net, dec("131.95"));
        assert_eq!(info.difference_montant_ttc, dec("175"));
        assert!(outcome
            .rectification
            .prestations
            .iter()
            .all(|p| p.invoice_id == Some(outcome.rectification.id)));
    }

    #[test]
    fn test_removed_lines_are_reported() {
        let original = original();
        let plan = RectificationPlan::prepare(
            &original,
            request(vec![ReplacementLine::unchanged(&original.prestations[1])]),
            Uuid::new_v4(),
            &BillingConfig::default(),
            today(),
        )
        .unwrap();

        assert_eq!(plan.diffs().len(), 1);
        assert_eq!(plan.diffs()[0].kind, DiffKind::Supprimee);
        assert_eq!(plan.diffs()[0].prestation_id, original.prestations[0].id);
        assert_eq!(plan.amounts().montant_ht, dec("150"));
    }

    #[test]
    fn test_validation_failures() {
        let original = original();
        let lines = vec![ReplacementLine::unchanged(&original.prestations[0])];
        let config = BillingConfig::default();

        let mut missing_motif = request(lines.clone());
        missing_motif.motif_legal = None;
        let err = RectificationPlan::prepare(&original, missing_motif, Uuid::new_v4(), &config, today())
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation { field: "motifLegal", .. }));

        let mut autre = request(lines.clone());
        autre.motif_legal = Some(MotifLegal::Autre);
        autre.details_motif = Some("   ".to_string());
        let err =
            RectificationPlan::prepare(&original, autre, Uuid::new_v4(), &config, today()).unwrap_err();
        assert!(matches!(err, BillingError::Validation { field: "detailsMotif", .. }));

        let err = RectificationPlan::prepare(&original, request(Vec::new()), Uuid::new_v4(), &config, today())
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation { field: "prestations", .. }));

        let unknown = hourly_line(LineRef::Existing(Uuid::new_v4()), 3, "1", "10");
        let err =
            RectificationPlan::prepare(&original, request(vec![unknown]), Uuid::new_v4(), &config, today())
                .unwrap_err();
        assert!(matches!(err, BillingError::Validation { field: "prestations", .. }));
    }

    #[test]
    fn test_only_open_sent_invoices_rectifiable() {
        let mut invoice = original();
        invoice.status = InvoiceStatus::Paid;
        let lines = vec![ReplacementLine::unchanged(&invoice.prestations[0])];
        let err = RectificationPlan::prepare(
            &invoice,
            request(lines),
            Uuid::new_v4(),
            &BillingConfig::default(),
            today(),
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_chain_traversal_in_order() {
        let config = BillingConfig::default();
        let first = original();
        let lines = vec![ReplacementLine::unchanged(&first.prestations[0])];
        let outcome = RectificationPlan::prepare(&first, request(lines), Uuid::new_v4(), &config, today())
            .unwrap()
            .finalize(43, Utc::now());

        let mut second = outcome.rectification;
        second.status = InvoiceStatus::Unpaid;
        second.is_sent_to_client = true;
        let lines = vec![ReplacementLine::unchanged(&second.prestations[0])];
        let next = RectificationPlan::prepare(&second, request(lines), Uuid::new_v4(), &config, today())
            .unwrap()
            .finalize(44, Utc::now());

        let invoices: HashMap<Uuid, Invoice> = [outcome.original, next.original, next.rectification]
            .into_iter()
            .map(|i| (i.id, i))
            .collect();

        for start in invoices.keys() {
            let numbers: Vec<i64> = rectification_chain(&invoices, *start)
                .iter()
                .map(|i| i.invoice_number)
                .collect();
            assert_eq!(numbers, vec![42, 43, 44]);
        }
    }
}
