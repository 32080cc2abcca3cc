use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, Result, Series};
use crate::lifecycle::RectificationOutcome;
use crate::models::{AccountContext, Client, Invoice, InvoiceStatus, Period, Prestation};
use crate::store::BillingStore;

#[derive(Debug, Default)]
struct AccountData {
    sequences: HashMap<Series, i64>,
    clients: HashMap<Uuid, Client>,
    prestations: HashMap<Uuid, Prestation>,
    invoices: HashMap<Uuid, Invoice>,
}

impl AccountData {
    fn check_number_free(&self, invoice: &Invoice) -> Result<()> {
        let taken = self
            .invoices
            .values()
            .any(|i| i.id != invoice.id && i.invoice_number == invoice.invoice_number);
        if taken {
            return Err(BillingError::SequenceAllocationConflict {
                series: Series::Invoice,
                number: invoice.invoice_number,
            });
        }
        Ok(())
    }

    fn check_avoir_number_free(&self, invoice: &Invoice) -> Result<()> {
        let Some(avoir) = &invoice.avoir else {
            return Ok(());
        };
        let taken = self.invoices.values().any(|i| {
            i.id != invoice.id && i.avoir.as_ref().map(|a| a.numero) == Some(avoir.numero)
        });
        if taken {
            return Err(BillingError::SequenceAllocationConflict {
                series: Series::Avoir,
                number: avoir.numero,
            });
        }
        Ok(())
    }

    fn check_version(&self, invoice: &Invoice) -> Result<()> {
        let stored = self
            .invoices
            .get(&invoice.id)
            .ok_or_else(|| BillingError::not_found("invoice", invoice.id))?;
        if stored.version != invoice.version {
            return Err(BillingError::Stale {
                entity: "invoice",
                id: invoice.id,
            });
        }
        Ok(())
    }

    fn mutable_prestation(&self, id: Uuid) -> Result<&Prestation> {
        let stored = self
            .prestations
            .get(&id)
            .ok_or_else(|| BillingError::not_found("prestation", id))?;
        stored.ensure_mutable()?;
        Ok(stored)
    }

    fn insert_invoice(&mut self, invoice: &Invoice) -> Invoice {
        let mut stored = invoice.clone();
        stored.version += 1;
        self.invoices.insert(stored.id, stored.clone());
        stored
    }
}

/// In-process store guarded by a single async mutex.
///
/// Every trait method runs under the lock, so each one is atomic with
/// respect to the others. Used by tests and local runs without Postgres.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<Uuid, AccountData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn allocate_number(&self, account: &AccountContext, series: Series) -> Result<i64> {
        let mut accounts = self.accounts.lock().await;
        let counter = accounts
            .entry(account.account_id)
            .or_default()
            .sequences
            .entry(series)
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn insert_client(&self, account: &AccountContext, client: &Client) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(account.account_id)
            .or_default()
            .clients
            .insert(client.id, client.clone());
        Ok(())
    }

    async fn get_client(&self, account: &AccountContext, id: Uuid) -> Result<Option<Client>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .get(&account.account_id)
            .and_then(|a| a.clients.get(&id))
            .cloned())
    }

    async fn list_clients(&self, account: &AccountContext) -> Result<Vec<Client>> {
        let accounts = self.accounts.lock().await;
        let mut clients: Vec<Client> = accounts
            .get(&account.account_id)
            .map(|a| a.clients.values().cloned().collect())
            .unwrap_or_default();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clients)
    }

    async fn delete_client(&self, account: &AccountContext, id: Uuid) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        let data = accounts
            .get_mut(&account.account_id)
            .ok_or_else(|| BillingError::not_found("client", id))?;
        if !data.clients.contains_key(&id) {
            return Err(BillingError::not_found("client", id));
        }
        let referenced = data.prestations.values().any(|p| p.client_id == id)
            || data.invoices.values().any(|i| i.client_id == id);
        if referenced {
            return Err(BillingError::validation(
                "client",
                "client still has prestations or invoices",
            ));
        }
        data.clients.remove(&id);
        Ok(())
    }

    async fn insert_prestation(&self, account: &AccountContext, prestation: &Prestation) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(account.account_id)
            .or_default()
            .prestations
            .insert(prestation.id, prestation.clone());
        Ok(())
    }

    async fn get_prestation(&self, account: &AccountContext, id: Uuid) -> Result<Option<Prestation>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .get(&account.account_id)
            .and_then(|a| a.prestations.get(&id))
            .cloned())
    }

    async fn list_prestations(
        &self,
        account: &AccountContext,
        period: Period,
        client_id: Option<Uuid>,
    ) -> Result<Vec<Prestation>> {
        let accounts = self.accounts.lock().await;
        let mut prestations: Vec<Prestation> = accounts
            .get(&account.account_id)
            .map(|a| {
                a.prestations
                    .values()
                    .filter(|p| period.contains(p.date))
                    .filter(|p| client_id.map_or(true, |c| p.client_id == c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        prestations.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        Ok(prestations)
    }

    async fn update_prestation(&self, account: &AccountContext, prestation: &Prestation) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        let data = accounts
            .get_mut(&account.account_id)
            .ok_or_else(|| BillingError::not_found("prestation", prestation.id))?;
        data.mutable_prestation(prestation.id)?;
        let mut next = prestation.clone();
        next.invoice_id = None;
        next.invoice_paid = false;
        data.prestations.insert(next.id, next);
        Ok(())
    }

    async fn delete_prestation(&self, account: &AccountContext, id: Uuid) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        let data = accounts
            .get_mut(&account.account_id)
            .ok_or_else(|| BillingError::not_found("prestation", id))?;
        data.mutable_prestation(id)?;
        data.prestations.remove(&id);
        Ok(())
    }

    async fn get_invoice(&self, account: &AccountContext, id: Uuid) -> Result<Option<Invoice>> {
        let accounts = self.accounts.lock().await;
        Ok(accounts
            .get(&account.account_id)
            .and_then(|a| a.invoices.get(&id))
            .cloned())
    }

    async fn list_invoices(&self, account: &AccountContext) -> Result<Vec<Invoice>> {
        let accounts = self.accounts.lock().await;
        let mut invoices: Vec<Invoice> = accounts
            .get(&account.account_id)
            .map(|a| a.invoices.values().cloned().collect())
            .unwrap_or_default();
        invoices.sort_by_key(|i| i.invoice_number);
        Ok(invoices)
    }

    async fn commit_generated_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<Invoice> {
        let mut accounts = self.accounts.lock().await;
        let data = accounts.entry(account.account_id).or_default();

        if invoice.claims_period()
            && data.invoices.values().any(|i| {
                i.client_id == invoice.client_id && i.period == invoice.period && i.claims_period()
            })
        {
            return Err(BillingError::DuplicatePeriod {
                client_id: invoice.client_id,
                period: invoice.period,
            });
        }

        for line in &invoice.prestations {
            let stored = data.mutable_prestation(line.id)?;
            let unattached = Prestation {
                invoice_id: None,
                invoice_paid: false,
                ..line.clone()
            };
            if *stored != unattached {
                return Err(BillingError::Stale {
                    entity: "prestation",
                    id: line.id,
                });
            }
        }
        data.check_number_free(invoice)?;

        for line in &invoice.prestations {
            data.prestations.insert(line.id, line.clone());
        }
        Ok(data.insert_invoice(invoice))
    }

    async fn update_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<Invoice> {
        let mut accounts = self.accounts.lock().await;
        let data = accounts
            .get_mut(&account.account_id)
            .ok_or_else(|| BillingError::not_found("invoice", invoice.id))?;
        data.check_version(invoice)?;
        data.check_avoir_number_free(invoice)?;

        let paid = invoice.status == InvoiceStatus::Paid;
        for prestation in data
            .prestations
            .values_mut()
            .filter(|p| p.invoice_id == Some(invoice.id))
        {
            prestation.invoice_paid = paid;
        }
        Ok(data.insert_invoice(invoice))
    }

    async fn delete_draft_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        let data = accounts
            .get_mut(&account.account_id)
            .ok_or_else(|| BillingError::not_found("invoice", invoice.id))?;
        data.check_version(invoice)?;

        data.invoices.remove(&invoice.id);
        if invoice.duplicated_from.is_some() {
            // Copied lines only exist through the duplicate
            data.prestations.retain(|_, p| p.invoice_id != Some(invoice.id));
            return Ok(());
        }
        for prestation in data
            .prestations
            .values_mut()
            .filter(|p| p.invoice_id == Some(invoice.id))
        {
            prestation.invoice_id = None;
            prestation.invoice_paid = false;
        }
        Ok(())
    }

    async fn commit_rectification(
        &self,
        account: &AccountContext,
        outcome: &RectificationOutcome,
    ) -> Result<(Invoice, Invoice)> {
        let mut accounts = self.accounts.lock().await;
        let data = accounts
            .get_mut(&account.account_id)
            .ok_or_else(|| BillingError::not_found("invoice", outcome.original.id))?;
        data.check_version(&outcome.original)?;
        data.check_number_free(&outcome.rectification)?;

        for line in &outcome.rectification.prestations {
            data.prestations.insert(line.id, line.clone());
        }
        let original = data.insert_invoice(&outcome.original);
        let rectification = data.insert_invoice(&outcome.rectification);
        Ok((original, rectification))
    }

    async fn insert_derived_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<Invoice> {
        let mut accounts = self.accounts.lock().await;
        let data = accounts.entry(account.account_id).or_default();
        data.check_number_free(invoice)?;

        for line in &invoice.prestations {
            data.prestations.insert(line.id, line.clone());
        }
        Ok(data.insert_invoice(invoice))
    }

    async fn list_overdue_candidates(&self, today: NaiveDate) -> Result<Vec<(AccountContext, Invoice)>> {
        let accounts = self.accounts.lock().await;
        let mut candidates: Vec<(AccountContext, Invoice)> = accounts
            .iter()
            .flat_map(|(account_id, data)| {
                data.invoices
                    .values()
                    .filter(|i| {
                        matches!(i.status, InvoiceStatus::Unpaid | InvoiceStatus::Overdue)
                            && i.is_sent_to_client
                            && !i.locked
                            && i.is_past_due(today)
                    })
                    .map(|i| (AccountContext::new(*account_id), i.clone()))
            })
            .collect();
        candidates.sort_by_key(|(_, i)| i.date_echeance);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::state_machine::tests::sample_invoice;
    use crate::models::prestation::{BillingInput, PrestationDraft};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn account() -> AccountContext {
        AccountContext::new(Uuid::new_v4())
    }

    fn prestation(client_id: Uuid) -> Prestation {
        PrestationDraft {
            client_id,
            date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            description: "Audit".to_string(),
            billing: BillingInput::Hourly {
                hours: Some(Decimal::from(2)),
                minutes: None,
                hourly_rate: Some(Decimal::from(50)),
            },
        }
        .into_prestation(Uuid::new_v4())
        .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_allocation_is_unique() {
        let store = Arc::new(MemoryStore::new());
        let account = account();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.allocate_number(&account, Series::Invoice).await })
            })
            .collect();

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap().unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=32).collect::<Vec<i64>>());

        // Series are independent
        assert_eq!(store.allocate_number(&account, Series::Avoir).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let store = MemoryStore::new();
        let (a, b) = (account(), account());
        assert_eq!(store.allocate_number(&a, Series::Invoice).await.unwrap(), 1);
        assert_eq!(store.allocate_number(&b, Series::Invoice).await.unwrap(), 1);

        let p = prestation(Uuid::new_v4());
        store.insert_prestation(&a, &p).await.unwrap();
        assert!(store.get_prestation(&b, p.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attached_prestation_is_immutable() {
        let store = MemoryStore::new();
        let account = account();
        let mut p = prestation(Uuid::new_v4());
        store.insert_prestation(&account, &p).await.unwrap();

        let mut invoice = sample_invoice(InvoiceStatus::Draft, false);
        invoice.version = 0;
        invoice.client_id = p.client_id;
        p.invoice_id = Some(invoice.id);
        invoice.prestations = vec![p.clone()];
        store.commit_generated_invoice(&account, &invoice).await.unwrap();

        p.description = "Changed".to_string();
        let err = store.update_prestation(&account, &p).await.unwrap_err();
        assert!(matches!(err, BillingError::ImmutablePrestation { .. }));
        let err = store.delete_prestation(&account, p.id).await.unwrap_err();
        assert!(matches!(err, BillingError::ImmutablePrestation { .. }));
    }

    /// Draft for `p`, as generation would build it from a snapshot.
    fn draft_owning(p: &Prestation) -> Invoice {
        let mut invoice = sample_invoice(InvoiceStatus::Draft, false);
        invoice.version = 0;
        invoice.client_id = p.client_id;
        invoice.prestations = vec![Prestation {
            invoice_id: Some(invoice.id),
            ..p.clone()
        }];
        invoice
    }

    #[tokio::test]
    async fn test_taken_invoice_number_conflicts() {
        let store = MemoryStore::new();
        let account = account();
        let first = prestation(Uuid::new_v4());
        let second = prestation(Uuid::new_v4());
        store.insert_prestation(&account, &first).await.unwrap();
        store.insert_prestation(&account, &second).await.unwrap();

        store
            .commit_generated_invoice(&account, &draft_owning(&first))
            .await
            .unwrap();

        // Another client, same number
        let err = store
            .commit_generated_invoice(&account, &draft_owning(&second))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::SequenceAllocationConflict {
                series: Series::Invoice,
                number: 42
            }
        ));
        let untouched = store.get_prestation(&account, second.id).await.unwrap().unwrap();
        assert_eq!(untouched.invoice_id, None);
    }

    #[tokio::test]
    async fn test_prestation_edited_after_snapshot_is_stale() {
        let store = MemoryStore::new();
        let account = account();
        let p = prestation(Uuid::new_v4());
        store.insert_prestation(&account, &p).await.unwrap();
        let invoice = draft_owning(&p);

        let edited = Prestation {
            description: "Audit complet".to_string(),
            ..p.clone()
        };
        store.update_prestation(&account, &edited).await.unwrap();

        let err = store.commit_generated_invoice(&account, &invoice).await.unwrap_err();
        assert!(matches!(err, BillingError::Stale { entity: "prestation", id } if id == p.id));
        assert!(store.list_invoices(&account).await.unwrap().is_empty());
        let stored = store.get_prestation(&account, p.id).await.unwrap().unwrap();
        assert_eq!(stored, edited);
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let store = MemoryStore::new();
        let account = account();
        let mut invoice = sample_invoice(InvoiceStatus::Draft, false);
        invoice.prestations.clear();
        invoice.version = 0;
        let stored = store.insert_derived_invoice(&account, &invoice).await.unwrap();
        assert_eq!(stored.version, 1);

        let updated = store.update_invoice(&account, &stored).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = store.update_invoice(&account, &stored).await.unwrap_err();
        assert!(matches!(err, BillingError::Stale { entity: "invoice", .. }));
    }

    #[tokio::test]
    async fn test_client_delete_blocked_while_referenced() {
        let store = MemoryStore::new();
        let account = account();
        let client = crate::models::CreateClient {
            name: "Acme".to_string(),
            ..Default::default()
        }
        .into_client(Uuid::new_v4(), chrono::Utc::now())
        .unwrap();
        store.insert_client(&account, &client).await.unwrap();
        let p = prestation(client.id);
        store.insert_prestation(&account, &p).await.unwrap();

        let err = store.delete_client(&account, client.id).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation { field: "client", .. }));

        store.delete_prestation(&account, p.id).await.unwrap();
        store.delete_client(&account, client.id).await.unwrap();
        assert!(store.get_client(&account, client.id).await.unwrap().is_none());
    }
}
