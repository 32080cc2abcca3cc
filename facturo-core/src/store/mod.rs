//! Persistence boundary of the billing engine.
//!
//! Every multi-record write (invoice plus attached prestations, original
//! plus rectification) goes through a single trait method so that the
//! implementation can commit it atomically.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::{Result, Series};
use crate::lifecycle::RectificationOutcome;
use crate::models::{AccountContext, Client, Invoice, Period, Prestation};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Storage used by [`crate::service::BillingService`].
///
/// Invoice writes are guarded by the `version` field: the caller passes
/// the invoice as it read it, and the write fails with `Stale` if the
/// stored version moved in between. Successful writes return the stored
/// invoice with its bumped version.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Atomically increments and returns the next number of `series`.
    /// Two concurrent callers never receive the same number.
    async fn allocate_number(&self, account: &AccountContext, series: Series) -> Result<i64>;

    async fn insert_client(&self, account: &AccountContext, client: &Client) -> Result<()>;
    async fn get_client(&self, account: &AccountContext, id: Uuid) -> Result<Option<Client>>;
    async fn list_clients(&self, account: &AccountContext) -> Result<Vec<Client>>;
    /// Fails with `Validation` while prestations or invoices reference the client.
    async fn delete_client(&self, account: &AccountContext, id: Uuid) -> Result<()>;

    async fn insert_prestation(&self, account: &AccountContext, prestation: &Prestation)
        -> Result<()>;
    async fn get_prestation(&self, account: &AccountContext, id: Uuid)
        -> Result<Option<Prestation>>;
    /// Prestations dated within `period`, optionally for one client, by date.
    async fn list_prestations(
        &self,
        account: &AccountContext,
        period: Period,
        client_id: Option<Uuid>,
    ) -> Result<Vec<Prestation>>;
    /// Replaces a prestation; fails with `ImmutablePrestation` if the stored
    /// record is attached to an invoice.
    async fn update_prestation(&self, account: &AccountContext, prestation: &Prestation)
        -> Result<()>;
    /// Same attachment rule as `update_prestation`.
    async fn delete_prestation(&self, account: &AccountContext, id: Uuid) -> Result<()>;

    async fn get_invoice(&self, account: &AccountContext, id: Uuid) -> Result<Option<Invoice>>;
    /// All invoices of the account, by number.
    async fn list_invoices(&self, account: &AccountContext) -> Result<Vec<Invoice>>;

    /// Inserts a generated invoice and attaches its prestations.
    ///
    /// Re-checks inside the commit that each snapshot prestation is still
    /// unattached and unchanged, and that no other invoice claims the same
    /// client and period.
    async fn commit_generated_invoice(&self, account: &AccountContext, invoice: &Invoice)
        -> Result<Invoice>;

    /// Writes a changed invoice. Attached prestation records follow the
    /// invoice's paid state.
    async fn update_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<Invoice>;

    /// Removes a draft and detaches its prestations.
    async fn delete_draft_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<()>;

    /// Writes the locked original and inserts the rectificative invoice,
    /// moving kept and new prestation records onto it.
    async fn commit_rectification(
        &self,
        account: &AccountContext,
        outcome: &RectificationOutcome,
    ) -> Result<(Invoice, Invoice)>;

    /// Inserts an invoice built from another one (duplication) together
    /// with its freshly created prestation records.
    async fn insert_derived_invoice(&self, account: &AccountContext, invoice: &Invoice)
        -> Result<Invoice>;

    /// Sent, unlocked, unpaid or overdue invoices whose due date is before
    /// `today`, across all accounts.
    async fn list_overdue_candidates(&self, today: NaiveDate)
        -> Result<Vec<(AccountContext, Invoice)>>;
}
