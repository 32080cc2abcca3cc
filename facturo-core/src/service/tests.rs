use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::BillingService;
use crate::config::BillingConfig;
use crate::error::{BillingError, ErrorKind};
use crate::lifecycle::{AvoirRequest, LineRef, PaymentRequest, RectificationRequest, ReplacementLine};
use crate::models::invoice::{InvoiceMarker, MotifLegal, PaymentMethod};
use crate::models::{
    AccountContext, BillingInput, Client, CreateClient, Invoice, InvoiceStatus, Period,
    PrestationDraft,
};
use crate::notifications::{Notifier, Outcome};
use crate::store::MemoryStore;

#[derive(Default)]
struct RecordingNotifier {
    outcomes: Mutex<Vec<Outcome>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, _account: &AccountContext, outcome: &Outcome) {
        self.outcomes.lock().unwrap().push(outcome.clone());
    }
}

struct Fixture {
    service: BillingService,
    notifier: Arc<RecordingNotifier>,
    account: AccountContext,
    client: Client,
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str_exact(s).unwrap()
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

fn march() -> Period {
    Period::new(2024, 3).unwrap()
}

fn hourly(client_id: Uuid, day: u32, hours: i64, rate: &str) -> PrestationDraft {
    PrestationDraft {
        client_id,
        date: date(2024, 3, day),
        description: format!("Développement {}h", hours),
        billing: BillingInput::Hourly {
            hours: Some(Decimal::from(hours)),
            minutes: None,
            hourly_rate: Some(dec(rate)),
        },
    }
}

async fn fixture() -> Fixture {
    let notifier = Arc::new(RecordingNotifier::default());
    let service = BillingService::with_notifier(
        Arc::new(MemoryStore::new()),
        BillingConfig::default(),
        notifier.clone(),
    );
    let account = AccountContext::new(Uuid::new_v4());
    let client = service
        .create_client(
            &account,
            CreateClient {
                name: "Studio Martin".to_string(),
                email: Some("factures@studio-martin.fr".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    Fixture {
        service,
        notifier,
        account,
        client,
    }
}

/// Invoice of March with two lines: 2h and 4h at 50/h (300 HT).
async fn march_invoice(fx: &Fixture) -> Invoice {
    for (day, hours) in [(4, 2), (12, 4)] {
        fx.service
            .create_prestation(&fx.account, hourly(fx.client.id, day, hours, "50"))
            .await
            .unwrap();
    }
    fx.service
        .generate_invoice(&fx.account, fx.client.id, march(), date(2024, 4, 1))
        .await
        .unwrap()
}

async fn paid_invoice(fx: &Fixture) -> Invoice {
    let invoice = march_invoice(fx).await;
    fx.service
        .mark_as_sent(&fx.account, invoice.id, date(2024, 4, 2))
        .await
        .unwrap();
    fx.service
        .record_payment(
            &fx.account,
            invoice.id,
            PaymentRequest {
                date: None,
                montant: None,
                methode: PaymentMethod::Virement,
            },
            date(2024, 4, 20),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_generate_invoice_amounts() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;

    assert_eq!(invoice.invoice_number, 1);
    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.amounts.montant_ht, dec("300"));
    assert_eq!(invoice.amounts.taxe_urssaf, dec("73.80"));
    assert_eq!(invoice.amounts.montant_net, dec("226.20"));
    assert_eq!(invoice.date_echeance, date(2024, 5, 1));
    assert_eq!(invoice.prestations.len(), 2);
    assert!(invoice.prestations.iter().all(|p| p.invoice_id == Some(invoice.id)));

    assert!(fx.notifier.outcomes.lock().unwrap().contains(&Outcome::InvoiceGenerated {
        invoice_id: invoice.id,
        invoice_number: 1,
    }));
}

#[tokio::test]
async fn test_invoiced_prestation_is_immutable() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;
    let line = invoice.prestations[0].clone();

    let err = fx
        .service
        .update_prestation(&fx.account, line.id, hourly(fx.client.id, 4, 9, "50"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::ImmutablePrestation { .. }));

    let err = fx.service.delete_prestation(&fx.account, line.id).await.unwrap_err();
    assert!(matches!(err, BillingError::ImmutablePrestation { .. }));

    let outcomes = fx.notifier.outcomes.lock().unwrap();
    assert!(outcomes.contains(&Outcome::Rejected {
        operation: "delete_prestation",
        kind: ErrorKind::ImmutablePrestation,
    }));
}

#[tokio::test]
async fn test_generate_without_prestations() {
    let fx = fixture().await;
    let err = fx
        .service
        .generate_invoice(&fx.account, fx.client.id, march(), date(2024, 4, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NoPrestationsFound { .. }));
}

#[tokio::test]
async fn test_second_generation_for_period_rejected() {
    let fx = fixture().await;
    march_invoice(&fx).await;
    fx.service
        .create_prestation(&fx.account, hourly(fx.client.id, 20, 1, "50"))
        .await
        .unwrap();

    let err = fx
        .service
        .generate_invoice(&fx.account, fx.client.id, march(), date(2024, 4, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::DuplicatePeriod { .. }));
}

#[tokio::test]
async fn test_concurrent_generation_single_winner() {
    let fx = fixture().await;
    for day in [4, 12] {
        fx.service
            .create_prestation(&fx.account, hourly(fx.client.id, day, 3, "80"))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let service = fx.service.clone();
            let account = fx.account;
            let client_id = fx.client.id;
            tokio::spawn(async move {
                service
                    .generate_invoice(&account, client_id, march(), date(2024, 4, 1))
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(|r| r.err()).unwrap();
    assert!(matches!(err, BillingError::DuplicatePeriod { .. }));

    let invoices = fx.service.list_invoices(&fx.account).await.unwrap();
    assert_eq!(invoices.len(), 1);
}

#[tokio::test]
async fn test_draft_delete_releases_prestations() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;

    fx.service
        .delete_invoice(&fx.account, invoice.id, date(2024, 4, 1))
        .await
        .unwrap();
    let summary = fx
        .service
        .month_summary(&fx.account, march(), Some(fx.client.id))
        .await
        .unwrap();
    assert_eq!(summary.partition.not_invoiced.len(), 2);

    // Numbers are never reused
    let again = fx
        .service
        .generate_invoice(&fx.account, fx.client.id, march(), date(2024, 4, 1))
        .await
        .unwrap();
    assert_eq!(again.invoice_number, 2);
}

#[tokio::test]
async fn test_sent_invoice_cannot_be_deleted() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;
    let sent = fx
        .service
        .mark_as_sent(&fx.account, invoice.id, date(2024, 4, 2))
        .await
        .unwrap();
    assert_eq!(sent.status, InvoiceStatus::Unpaid);
    assert!(sent.is_sent_to_client);

    let err = fx
        .service
        .delete_invoice(&fx.account, invoice.id, date(2024, 4, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_payment_marks_prestations_paid() {
    let fx = fixture().await;
    let invoice = paid_invoice(&fx).await;

    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.date_paiement, Some(date(2024, 4, 20)));
    assert_eq!(invoice.historique_paiements[0].montant, invoice.amounts.montant_ttc);

    let summary = fx.service.month_summary(&fx.account, march(), None).await.unwrap();
    assert_eq!(summary.partition.invoiced_paid.len(), 2);
    assert_eq!(summary.total, dec("300"));
}

#[tokio::test]
async fn test_reminders_escalate_until_paid() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;
    fx.service
        .mark_as_sent(&fx.account, invoice.id, date(2024, 4, 2))
        .await
        .unwrap();

    // Not yet due
    assert!(fx
        .service
        .record_reminder(&fx.account, invoice.id, date(2024, 5, 1))
        .await
        .is_err());

    let first = fx
        .service
        .record_reminder(&fx.account, invoice.id, date(2024, 5, 2))
        .await
        .unwrap();
    assert_eq!(first.status, InvoiceStatus::Overdue);
    let second = fx
        .service
        .record_reminder(&fx.account, invoice.id, date(2024, 5, 9))
        .await
        .unwrap();
    assert_eq!(second.rappels.last().map(|r| r.niveau), Some(2));

    let paid = fx
        .service
        .record_payment(
            &fx.account,
            invoice.id,
            PaymentRequest {
                date: Some(date(2024, 5, 10)),
                montant: Some(dec("300")),
                methode: PaymentMethod::Cheque,
            },
            date(2024, 5, 10),
        )
        .await
        .unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn test_rectification_locks_original() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;
    fx.service
        .mark_as_sent(&fx.account, invoice.id, date(2024, 4, 2))
        .await
        .unwrap();

    let kept = ReplacementLine::unchanged(&invoice.prestations[0]);
    let mut changed = ReplacementLine::unchanged(&invoice.prestations[1]);
    changed.billing = BillingInput::Hourly {
        hours: Some(Decimal::from(7)),
        minutes: None,
        hourly_rate: Some(dec("50")),
    };
    let added = ReplacementLine {
        line: LineRef::New("tmp-1".to_string()),
        date: date(2024, 3, 28),
        description: "Recette".to_string(),
        billing: BillingInput::Hourly {
            hours: Some(Decimal::from(1)),
            minutes: Some(Decimal::from(30)),
            hourly_rate: Some(dec("50")),
        },
    };

    let outcome = fx
        .service
        .rectify_invoice(
            &fx.account,
            invoice.id,
            RectificationRequest {
                motif_legal: Some(MotifLegal::ErreurMontant),
                details_motif: None,
                client_id: None,
                prestations: vec![kept, changed, added],
            },
            date(2024, 4, 10),
        )
        .await
        .unwrap();

    assert!(outcome.original.locked);
    assert_eq!(outcome.original.statut, Some(InvoiceMarker::Rectifiee));
    assert_eq!(outcome.original.rectifications, vec![outcome.rectification.id]);

    let info = outcome.rectification.rectification_info.as_ref().unwrap();
    assert_eq!(info.original_invoice_number, invoice.invoice_number);
    assert_eq!(outcome.rectification.invoice_number, invoice.invoice_number + 1);
    // 100 + 350 + 75
    assert_eq!(outcome.rectification.amounts.montant_ht, dec("525"));
    assert_eq!(info.difference_montant_ht, dec("225"));

    let err = fx
        .service
        .record_payment(
            &fx.account,
            invoice.id,
            PaymentRequest {
                date: None,
                montant: None,
                methode: PaymentMethod::Virement,
            },
            date(2024, 4, 11),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidStateTransition { .. }));

    let chain = fx
        .service
        .rectification_chain(&fx.account, outcome.rectification.id)
        .await
        .unwrap();
    let numbers: Vec<i64> = chain.iter().map(|i| i.invoice_number).collect();
    assert_eq!(numbers, vec![invoice.invoice_number, invoice.invoice_number + 1]);

    // Lines moved onto the rectification stay frozen
    let moved = fx
        .service
        .get_prestation(&fx.account, invoice.prestations[1].id)
        .await
        .unwrap();
    assert_eq!(moved.invoice_id, Some(outcome.rectification.id));
}

#[tokio::test]
async fn test_rectification_rejected_without_motif_allocates_nothing() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;
    fx.service
        .mark_as_sent(&fx.account, invoice.id, date(2024, 4, 2))
        .await
        .unwrap();

    let err = fx
        .service
        .rectify_invoice(
            &fx.account,
            invoice.id,
            RectificationRequest {
                motif_legal: None,
                details_motif: None,
                client_id: None,
                prestations: invoice.prestations.iter().map(ReplacementLine::unchanged).collect(),
            },
            date(2024, 4, 10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { field: "motifLegal", .. }));

    let original = fx.service.get_invoice(&fx.account, invoice.id).await.unwrap();
    assert!(!original.locked);

    let copy = fx
        .service
        .duplicate_invoice(&fx.account, invoice.id, date(2024, 4, 10))
        .await
        .unwrap();
    assert_eq!(copy.invoice_number, 2);
}

#[tokio::test]
async fn test_avoir_keeps_stored_net() {
    let fx = fixture().await;
    let invoice = paid_invoice(&fx).await;

    let credited = fx
        .service
        .create_avoir(
            &fx.account,
            invoice.id,
            AvoirRequest {
                montant: Some(dec("50.00")),
                motif: "Geste commercial".to_string(),
                ..Default::default()
            },
            date(2024, 4, 25),
        )
        .await
        .unwrap();

    assert_eq!(credited.avoir.as_ref().map(|a| a.numero), Some(1));
    assert_eq!(credited.amounts.montant_net, dec("226.20"));

    let document = fx.service.invoice_document(&fx.account, invoice.id).await.unwrap();
    assert_eq!(document.net_after_avoir, dec("176.20"));

    let err = fx
        .service
        .create_avoir(
            &fx.account,
            invoice.id,
            AvoirRequest {
                montant: Some(dec("10")),
                motif: "Second".to_string(),
                ..Default::default()
            },
            date(2024, 4, 26),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_avoir_amount_bounded() {
    let fx = fixture().await;
    let invoice = paid_invoice(&fx).await;

    let err = fx
        .service
        .create_avoir(
            &fx.account,
            invoice.id,
            AvoirRequest {
                montant: Some(dec("300.01")),
                motif: "Trop".to_string(),
                ..Default::default()
            },
            date(2024, 4, 25),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::AmountExceedsOriginal { .. }));
}

#[tokio::test]
async fn test_duplicate_creates_independent_draft() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;

    let copy = fx
        .service
        .duplicate_invoice(&fx.account, invoice.id, date(2024, 4, 15))
        .await
        .unwrap();

    assert_eq!(copy.invoice_number, 2);
    assert_eq!(copy.status, InvoiceStatus::Draft);
    assert_eq!(copy.duplicated_from, Some(invoice.id));
    assert_eq!(copy.amounts, invoice.amounts);
    assert!(copy
        .prestations
        .iter()
        .all(|p| p.invoice_id == Some(copy.id) && !invoice.prestations.iter().any(|o| o.id == p.id)));
}

#[tokio::test]
async fn test_deleting_duplicate_removes_copied_lines() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;
    let copy = fx
        .service
        .duplicate_invoice(&fx.account, invoice.id, date(2024, 4, 15))
        .await
        .unwrap();

    fx.service
        .delete_invoice(&fx.account, copy.id, date(2024, 4, 15))
        .await
        .unwrap();

    let summary = fx
        .service
        .month_summary(&fx.account, march(), Some(fx.client.id))
        .await
        .unwrap();
    assert!(summary.partition.not_invoiced.is_empty());
    assert_eq!(summary.partition.invoiced_unpaid.len(), 2);
    assert_eq!(summary.total, dec("300"));
    for line in &copy.prestations {
        let err = fx.service.get_prestation(&fx.account, line.id).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound { entity: "prestation", .. }));
    }
}

#[tokio::test]
async fn test_cancel_requires_motif() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;
    fx.service
        .mark_as_sent(&fx.account, invoice.id, date(2024, 4, 2))
        .await
        .unwrap();

    let err = fx
        .service
        .cancel_invoice(&fx.account, invoice.id, "  ", date(2024, 4, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::Validation { field: "motif", .. }));

    let cancelled = fx
        .service
        .cancel_invoice(&fx.account, invoice.id, "Mission annulée", date(2024, 4, 3))
        .await
        .unwrap();
    assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
    assert!(!cancelled.claims_period());
}

#[tokio::test]
async fn test_accounts_do_not_see_each_other() {
    let fx = fixture().await;
    let invoice = march_invoice(&fx).await;
    let other = AccountContext::new(Uuid::new_v4());

    let err = fx.service.get_invoice(&other, invoice.id).await.unwrap_err();
    assert!(matches!(err, BillingError::NotFound { entity: "invoice", .. }));

    let err = fx
        .service
        .create_prestation(&other, hourly(fx.client.id, 5, 1, "50"))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::NotFound { entity: "client", .. }));
}
