//! In-process API of the billing engine.
//!
//! `BillingService` ties the pure calculator, aggregator and lifecycle
//! code to a [`BillingStore`]. Every operation takes the caller's
//! [`AccountContext`] explicitly and reports its outcome to a
//! [`Notifier`].

use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::billing::{select_for_invoice, summarize, PeriodSummary};
use crate::config::BillingConfig;
use crate::error::{BillingError, ErrorKind, Result, Series};
use crate::lifecycle::{
    operations, rectification_chain, AvoirPlan, AvoirRequest, PaymentRequest,
    RectificationOutcome, RectificationPlan, RectificationRequest,
};
use crate::models::{
    AccountContext, Client, CreateClient, Invoice, InvoiceDocument, Period, Prestation,
    PrestationDraft,
};
use crate::notifications::{Notifier, Outcome, TracingNotifier};
use crate::store::BillingStore;

#[cfg(test)]
mod tests;

/// Billing engine entry point.
#[derive(Clone)]
pub struct BillingService {
    store: Arc<dyn BillingStore>,
    config: BillingConfig,
    notifier: Arc<dyn Notifier>,
}

impl BillingService {
    /// Creates a service that logs its outcomes.
    pub fn new(store: Arc<dyn BillingStore>, config: BillingConfig) -> Self {
        Self::with_notifier(store, config, Arc::new(TracingNotifier))
    }

    pub fn with_notifier(
        store: Arc<dyn BillingStore>,
        config: BillingConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            config,
            notifier,
        }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    /// Signals `outcome` for a committed operation.
    fn emit(&self, account: &AccountContext, outcome: Outcome) {
        self.notifier.notify(account, &outcome);
    }

    /// Logs and signals a failed operation; passes the result through.
    fn report<T>(&self, account: &AccountContext, operation: &'static str, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            let kind = err.kind();
            if kind == ErrorKind::Internal {
                error!(operation, error = %err, "Operation failed");
            } else {
                warn!(operation, error = %err, "Operation rejected");
            }
            self.emit(account, Outcome::Rejected { operation, kind });
        }
        result
    }

    async fn load_invoice(&self, account: &AccountContext, id: Uuid) -> Result<Invoice> {
        self.store
            .get_invoice(account, id)
            .await?
            .ok_or_else(|| BillingError::not_found("invoice", id))
    }

    async fn require_client(&self, account: &AccountContext, id: Uuid) -> Result<Client> {
        self.store
            .get_client(account, id)
            .await?
            .ok_or_else(|| BillingError::not_found("client", id))
    }

    // -------------------------------------------------------------------------
    // Clients
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(account_id = %account.account_id))]
    pub async fn create_client(&self, account: &AccountContext, input: CreateClient) -> Result<Client> {
        let result = async {
            let client = input.into_client(Uuid::new_v4(), Utc::now())?;
            self.store.insert_client(account, &client).await?;
            info!(client_id = %client.id, "Client created");
            Ok::<_, BillingError>(client)
        }
        .await;
        self.report(account, "create_client", result)
    }

    pub async fn get_client(&self, account: &AccountContext, id: Uuid) -> Result<Client> {
        self.require_client(account, id).await
    }

    pub async fn list_clients(&self, account: &AccountContext) -> Result<Vec<Client>> {
        self.store.list_clients(account).await
    }

    #[instrument(skip(self), fields(account_id = %account.account_id))]
    pub async fn delete_client(&self, account: &AccountContext, id: Uuid) -> Result<()> {
        let result = self.store.delete_client(account, id).await;
        self.report(account, "delete_client", result)
    }

    // -------------------------------------------------------------------------
    // Prestations
    // -------------------------------------------------------------------------

    #[instrument(skip(self, draft), fields(account_id = %account.account_id))]
    pub async fn create_prestation(
        &self,
        account: &AccountContext,
        draft: PrestationDraft,
    ) -> Result<Prestation> {
        let result = async {
            self.require_client(account, draft.client_id).await?;
            let prestation = draft.into_prestation(Uuid::new_v4())?;
            self.store.insert_prestation(account, &prestation).await?;
            info!(prestation_id = %prestation.id, total = %prestation.total, "Prestation created");
            Ok::<_, BillingError>(prestation)
        }
        .await;
        self.report(account, "create_prestation", result)
    }

    pub async fn get_prestation(&self, account: &AccountContext, id: Uuid) -> Result<Prestation> {
        self.store
            .get_prestation(account, id)
            .await?
            .ok_or_else(|| BillingError::not_found("prestation", id))
    }

    /// Replaces an uninvoiced prestation with the recomputed draft.
    #[instrument(skip(self, draft), fields(account_id = %account.account_id))]
    pub async fn update_prestation(
        &self,
        account: &AccountContext,
        id: Uuid,
        draft: PrestationDraft,
    ) -> Result<Prestation> {
        let result = async {
            let current = self.get_prestation(account, id).await?;
            current.ensure_mutable()?;
            self.require_client(account, draft.client_id).await?;

            let prestation = draft.into_prestation(id)?;
            self.store.update_prestation(account, &prestation).await?;
            info!(prestation_id = %id, total = %prestation.total, "Prestation updated");
            Ok::<_, BillingError>(prestation)
        }
        .await;
        self.report(account, "update_prestation", result)
    }

    #[instrument(skip(self), fields(account_id = %account.account_id))]
    pub async fn delete_prestation(&self, account: &AccountContext, id: Uuid) -> Result<()> {
        let result = async {
            self.get_prestation(account, id).await?.ensure_mutable()?;
            self.store.delete_prestation(account, id).await?;
            info!(prestation_id = %id, "Prestation deleted");
            Ok::<_, BillingError>(())
        }
        .await;
        self.report(account, "delete_prestation", result)
    }

    /// Date-grouped view of a month, optionally for a single client.
    pub async fn month_summary(
        &self,
        account: &AccountContext,
        period: Period,
        client_id: Option<Uuid>,
    ) -> Result<PeriodSummary> {
        let prestations = self.store.list_prestations(account, period, client_id).await?;
        summarize(&prestations, period, client_id)
    }

    // -------------------------------------------------------------------------
    // Invoices
    // -------------------------------------------------------------------------

    /// Builds a draft invoice from the client's uninvoiced prestations of
    /// `period` and attaches them to it.
    #[instrument(skip(self), fields(account_id = %account.account_id))]
    pub async fn generate_invoice(
        &self,
        account: &AccountContext,
        client_id: Uuid,
        period: Period,
        date_facture: NaiveDate,
    ) -> Result<Invoice> {
        let result = async {
            self.require_client(account, client_id).await?;

            // Read before the period check: a generation committed in between
            // must surface as a duplicate period.
            let prestations = self
                .store
                .list_prestations(account, period, Some(client_id))
                .await?;

            let existing = self.store.list_invoices(account).await?;
            if existing
                .iter()
                .any(|i| i.client_id == client_id && i.period == period && i.claims_period())
            {
                return Err(BillingError::DuplicatePeriod { client_id, period });
            }

            let selected = select_for_invoice(&prestations, client_id, period)?;

            let number = self.store.allocate_number(account, Series::Invoice).await?;
            let invoice = operations::new_draft(
                Uuid::new_v4(),
                number,
                client_id,
                period,
                selected,
                date_facture,
                &self.config,
                Utc::now(),
            )?;
            let stored = self.store.commit_generated_invoice(account, &invoice).await?;

            info!(
                invoice_number = stored.invoice_number,
                montant_ht = %stored.amounts.montant_ht,
                lines = stored.prestations.len(),
                "Invoice generated"
            );
            self.emit(
                account,
                Outcome::InvoiceGenerated {
                    invoice_id: stored.id,
                    invoice_number: stored.invoice_number,
                },
            );
            Ok::<_, BillingError>(stored)
        }
        .await;
        self.report(account, "generate_invoice", result)
    }

    pub async fn get_invoice(&self, account: &AccountContext, id: Uuid) -> Result<Invoice> {
        self.load_invoice(account, id).await
    }

    pub async fn list_invoices(&self, account: &AccountContext) -> Result<Vec<Invoice>> {
        self.store.list_invoices(account).await
    }

    /// Frozen snapshot handed to document rendering.
    pub async fn invoice_document(&self, account: &AccountContext, id: Uuid) -> Result<InvoiceDocument> {
        Ok(self.load_invoice(account, id).await?.document())
    }

    #[instrument(skip(self), fields(account_id = %account.account_id))]
    pub async fn mark_as_sent(&self, account: &AccountContext, id: Uuid, today: NaiveDate) -> Result<Invoice> {
        let result = async {
            let mut invoice = self.load_invoice(account, id).await?;
            operations::mark_as_sent(&mut invoice, today, Utc::now())?;
            let stored = self.store.update_invoice(account, &invoice).await?;
            self.emit(
                account,
                Outcome::InvoiceSent {
                    invoice_number: stored.invoice_number,
                },
            );
            Ok::<_, BillingError>(stored)
        }
        .await;
        self.report(account, "mark_as_sent", result)
    }

    /// Removes a never-sent draft; its prestations become invoiceable again.
    #[instrument(skip(self), fields(account_id = %account.account_id))]
    pub async fn delete_invoice(&self, account: &AccountContext, id: Uuid, today: NaiveDate) -> Result<()> {
        let result = async {
            let invoice = self.load_invoice(account, id).await?;
            operations::check_delete(&invoice, today)?;
            self.store.delete_draft_invoice(account, &invoice).await?;
            info!(invoice_number = invoice.invoice_number, "Draft invoice deleted");
            self.emit(
                account,
                Outcome::InvoiceDeleted {
                    invoice_number: invoice.invoice_number,
                },
            );
            Ok::<_, BillingError>(())
        }
        .await;
        self.report(account, "delete_invoice", result)
    }

    #[instrument(skip(self, request), fields(account_id = %account.account_id))]
    pub async fn record_payment(
        &self,
        account: &AccountContext,
        id: Uuid,
        request: PaymentRequest,
        today: NaiveDate,
    ) -> Result<Invoice> {
        let result = async {
            let mut invoice = self.load_invoice(account, id).await?;
            let payment = operations::record_payment(&mut invoice, request, today, Utc::now())?;
            let stored = self.store.update_invoice(account, &invoice).await?;
            info!(
                invoice_number = stored.invoice_number,
                montant = %payment.montant,
                "Payment recorded"
            );
            self.emit(
                account,
                Outcome::PaymentRecorded {
                    invoice_number: stored.invoice_number,
                    montant: payment.montant,
                },
            );
            Ok::<_, BillingError>(stored)
        }
        .await;
        self.report(account, "record_payment", result)
    }

    /// Applies `reminder-elapsed`: the invoice becomes overdue and gets a
    /// new reminder one level above the previous one.
    #[instrument(skip(self), fields(account_id = %account.account_id))]
    pub async fn record_reminder(&self, account: &AccountContext, id: Uuid, today: NaiveDate) -> Result<Invoice> {
        let result = async {
            let mut invoice = self.load_invoice(account, id).await?;
            let reminder = operations::record_reminder(&mut invoice, today, Utc::now())?;
            let stored = self.store.update_invoice(account, &invoice).await?;
            info!(
                invoice_number = stored.invoice_number,
                niveau = reminder.niveau,
                "Reminder recorded"
            );
            self.emit(
                account,
                Outcome::ReminderRecorded {
                    invoice_number: stored.invoice_number,
                    niveau: reminder.niveau,
                },
            );
            Ok::<_, BillingError>(stored)
        }
        .await;
        self.report(account, "record_reminder", result)
    }

    #[instrument(skip(self, motif), fields(account_id = %account.account_id))]
    pub async fn cancel_invoice(
        &self,
        account: &AccountContext,
        id: Uuid,
        motif: &str,
        today: NaiveDate,
    ) -> Result<Invoice> {
        let result = async {
            let mut invoice = self.load_invoice(account, id).await?;
            operations::cancel(&mut invoice, motif, today, Utc::now())?;
            let stored = self.store.update_invoice(account, &invoice).await?;
            info!(invoice_number = stored.invoice_number, "Invoice cancelled");
            self.emit(
                account,
                Outcome::InvoiceCancelled {
                    invoice_number: stored.invoice_number,
                },
            );
            Ok::<_, BillingError>(stored)
        }
        .await;
        self.report(account, "cancel_invoice", result)
    }

    /// Supersedes an invoice with a rectificative one.
    ///
    /// The request is fully validated before a number is allocated; the
    /// locked original and the new invoice are committed together.
    #[instrument(skip(self, request), fields(account_id = %account.account_id))]
    pub async fn rectify_invoice(
        &self,
        account: &AccountContext,
        id: Uuid,
        request: RectificationRequest,
        today: NaiveDate,
    ) -> Result<RectificationOutcome> {
        let result = async {
            let original = self.load_invoice(account, id).await?;
            if let Some(client_id) = request.client_id {
                self.require_client(account, client_id).await?;
            }

            let plan = RectificationPlan::prepare(&original, request, Uuid::new_v4(), &self.config, today)?;
            let number = self.store.allocate_number(account, Series::Invoice).await?;
            let outcome = plan.finalize(number, Utc::now());
            let (original, rectification) = self.store.commit_rectification(account, &outcome).await?;

            info!(
                original = original.invoice_number,
                rectification = rectification.invoice_number,
                "Invoice rectified"
            );
            self.emit(
                account,
                Outcome::InvoiceRectified {
                    original_number: original.invoice_number,
                    rectification_number: rectification.invoice_number,
                },
            );
            Ok::<_, BillingError>(RectificationOutcome {
                original,
                rectification,
            })
        }
        .await;
        self.report(account, "rectify_invoice", result)
    }

    /// Attaches a credit note to a paid invoice. The invoice amounts are
    /// left unchanged; the net after avoir is derived.
    #[instrument(skip(self, request), fields(account_id = %account.account_id))]
    pub async fn create_avoir(
        &self,
        account: &AccountContext,
        id: Uuid,
        request: AvoirRequest,
        today: NaiveDate,
    ) -> Result<Invoice> {
        let result = async {
            let mut invoice = self.load_invoice(account, id).await?;
            let plan = AvoirPlan::prepare(&invoice, request, today)?;
            let numero = self.store.allocate_number(account, Series::Avoir).await?;
            let avoir = plan.attach(&mut invoice, numero, Utc::now());
            let stored = self.store.update_invoice(account, &invoice).await?;

            info!(
                invoice_number = stored.invoice_number,
                numero,
                montant = %avoir.montant,
                "Avoir created"
            );
            self.emit(
                account,
                Outcome::AvoirCreated {
                    invoice_number: stored.invoice_number,
                    numero,
                    montant: avoir.montant,
                },
            );
            Ok::<_, BillingError>(stored)
        }
        .await;
        self.report(account, "create_avoir", result)
    }

    /// Copies an invoice into a new draft under a new number.
    #[instrument(skip(self), fields(account_id = %account.account_id))]
    pub async fn duplicate_invoice(&self, account: &AccountContext, id: Uuid, today: NaiveDate) -> Result<Invoice> {
        let result = async {
            let source = self.load_invoice(account, id).await?;
            let number = self.store.allocate_number(account, Series::Invoice).await?;
            let copy = operations::duplicate(&source, Uuid::new_v4(), number, today, &self.config, Utc::now())?;
            let stored = self.store.insert_derived_invoice(account, &copy).await?;

            info!(
                source = source.invoice_number,
                invoice_number = stored.invoice_number,
                "Invoice duplicated"
            );
            self.emit(
                account,
                Outcome::InvoiceDuplicated {
                    source_number: source.invoice_number,
                    invoice_number: stored.invoice_number,
                },
            );
            Ok::<_, BillingError>(stored)
        }
        .await;
        self.report(account, "duplicate_invoice", result)
    }

    /// Every invoice of the rectification chain containing `id`, root first.
    pub async fn rectification_chain(&self, account: &AccountContext, id: Uuid) -> Result<Vec<Invoice>> {
        let invoices: HashMap<Uuid, Invoice> = self
            .store
            .list_invoices(account)
            .await?
            .into_iter()
            .map(|i| (i.id, i))
            .collect();

        let chain = rectification_chain(&invoices, id);
        if chain.is_empty() {
            return Err(BillingError::not_found("invoice", id));
        }
        Ok(chain)
    }
}
