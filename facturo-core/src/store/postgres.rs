use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{BillingError, Result, Series};
use crate::lifecycle::RectificationOutcome;
use crate::models::{AccountContext, Client, Invoice, InvoiceStatus, Period, Prestation};
use crate::store::BillingStore;

/// Postgres-backed store.
///
/// Records are kept as JSONB documents next to the columns the engine
/// filters and locks on. Multi-record writes run in one transaction with
/// the touched rows locked `FOR UPDATE`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Maps unique-constraint violations to the domain error they stand for.
fn map_conflict(err: sqlx::Error, invoice: &Invoice) -> BillingError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            match db_err.constraint() {
                Some("invoices_period_unique") => {
                    return BillingError::DuplicatePeriod {
                        client_id: invoice.client_id,
                        period: invoice.period,
                    }
                }
                Some("invoices_number_unique") => {
                    return BillingError::SequenceAllocationConflict {
                        series: Series::Invoice,
                        number: invoice.invoice_number,
                    }
                }
                Some("avoirs_pkey") => {
                    if let Some(avoir) = &invoice.avoir {
                        return BillingError::SequenceAllocationConflict {
                            series: Series::Avoir,
                            number: avoir.numero,
                        };
                    }
                }
                _ => {}
            }
        }
    }
    BillingError::Database(err)
}

async fn insert_invoice_row(
    tx: &mut Transaction<'_, Postgres>,
    account: &AccountContext,
    invoice: &Invoice,
) -> Result<Invoice> {
    let mut stored = invoice.clone();
    stored.version += 1;

    sqlx::query(
        r#"
        INSERT INTO invoices (
            id, account_id, invoice_number, client_id, period_year, period_month, status,
            is_sent_to_client, locked, claims_period, date_echeance, version, document
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(stored.id)
    .bind(account.account_id)
    .bind(stored.invoice_number)
    .bind(stored.client_id)
    .bind(stored.period.year)
    .bind(stored.period.month as i32)
    .bind(stored.status.as_str())
    .bind(stored.is_sent_to_client)
    .bind(stored.locked)
    .bind(stored.claims_period())
    .bind(stored.date_echeance)
    .bind(stored.version)
    .bind(Json(&stored))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_conflict(e, &stored))?;

    Ok(stored)
}

/// Locks the invoice row and checks the caller saw the latest version.
async fn lock_version(
    tx: &mut Transaction<'_, Postgres>,
    account: &AccountContext,
    invoice: &Invoice,
) -> Result<()> {
    let current: Option<i64> = sqlx::query_scalar(
        "SELECT version FROM invoices WHERE id = $1 AND account_id = $2 FOR UPDATE",
    )
    .bind(invoice.id)
    .bind(account.account_id)
    .fetch_optional(&mut **tx)
    .await?;

    match current {
        None => Err(BillingError::not_found("invoice", invoice.id)),
        Some(version) if version != invoice.version => Err(BillingError::Stale {
            entity: "invoice",
            id: invoice.id,
        }),
        Some(_) => Ok(()),
    }
}

async fn update_invoice_row(
    tx: &mut Transaction<'_, Postgres>,
    account: &AccountContext,
    invoice: &Invoice,
) -> Result<Invoice> {
    lock_version(tx, account, invoice).await?;

    let mut stored = invoice.clone();
    stored.version += 1;

    sqlx::query(
        r#"
        UPDATE invoices
        SET client_id = $3, status = $4, is_sent_to_client = $5, locked = $6,
            claims_period = $7, date_echeance = $8, version = $9, document = $10
        WHERE id = $1 AND account_id = $2
        "#,
    )
    .bind(stored.id)
    .bind(account.account_id)
    .bind(stored.client_id)
    .bind(stored.status.as_str())
    .bind(stored.is_sent_to_client)
    .bind(stored.locked)
    .bind(stored.claims_period())
    .bind(stored.date_echeance)
    .bind(stored.version)
    .bind(Json(&stored))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_conflict(e, &stored))?;

    Ok(stored)
}

async fn upsert_prestation_row(
    tx: &mut Transaction<'_, Postgres>,
    account: &AccountContext,
    prestation: &Prestation,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO prestations (id, account_id, client_id, date, invoice_id, document)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE
        SET client_id = EXCLUDED.client_id, date = EXCLUDED.date,
            invoice_id = EXCLUDED.invoice_id, document = EXCLUDED.document
        WHERE prestations.account_id = EXCLUDED.account_id
        "#,
    )
    .bind(prestation.id)
    .bind(account.account_id)
    .bind(prestation.client_id)
    .bind(prestation.date)
    .bind(prestation.invoice_id)
    .bind(Json(prestation))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Locks a prestation row and rejects it if attached to an invoice.
async fn lock_mutable_prestation(
    tx: &mut Transaction<'_, Postgres>,
    account: &AccountContext,
    id: Uuid,
) -> Result<()> {
    let owner: Option<Option<Uuid>> = sqlx::query_scalar(
        "SELECT invoice_id FROM prestations WHERE id = $1 AND account_id = $2 FOR UPDATE",
    )
    .bind(id)
    .bind(account.account_id)
    .fetch_optional(&mut **tx)
    .await?;

    match owner {
        None => Err(BillingError::not_found("prestation", id)),
        Some(Some(invoice_id)) => Err(BillingError::ImmutablePrestation {
            prestation_id: id,
            invoice_id,
        }),
        Some(None) => Ok(()),
    }
}

#[async_trait]
impl BillingStore for PgStore {
    #[instrument(skip(self))]
    async fn allocate_number(&self, account: &AccountContext, series: Series) -> Result<i64> {
        let number: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO number_sequences (account_id, series, value)
            VALUES ($1, $2, 1)
            ON CONFLICT (account_id, series)
            DO UPDATE SET value = number_sequences.value + 1
            RETURNING value
            "#,
        )
        .bind(account.account_id)
        .bind(series.to_string())
        .fetch_one(&self.pool)
        .await?;

        debug!(%series, number, "Allocated number");
        Ok(number)
    }

    async fn insert_client(&self, account: &AccountContext, client: &Client) -> Result<()> {
        sqlx::query(
            "INSERT INTO clients (id, account_id, name, document, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(client.id)
        .bind(account.account_id)
        .bind(&client.name)
        .bind(Json(client))
        .bind(client.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_client(&self, account: &AccountContext, id: Uuid) -> Result<Option<Client>> {
        let row: Option<Json<Client>> =
            sqlx::query_scalar("SELECT document FROM clients WHERE id = $1 AND account_id = $2")
                .bind(id)
                .bind(account.account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|Json(client)| client))
    }

    async fn list_clients(&self, account: &AccountContext) -> Result<Vec<Client>> {
        let rows: Vec<Json<Client>> =
            sqlx::query_scalar("SELECT document FROM clients WHERE account_id = $1 ORDER BY name")
                .bind(account.account_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|Json(client)| client).collect())
    }

    async fn delete_client(&self, account: &AccountContext, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM clients WHERE id = $1 AND account_id = $2 FOR UPDATE",
        )
        .bind(id)
        .bind(account.account_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(BillingError::not_found("client", id));
        }

        let referenced: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM prestations WHERE client_id = $1)
                OR EXISTS (SELECT 1 FROM invoices WHERE client_id = $1)
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if referenced {
            return Err(BillingError::validation(
                "client",
                "client still has prestations or invoices",
            ));
        }

        sqlx::query("DELETE FROM clients WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_prestation(&self, account: &AccountContext, prestation: &Prestation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO prestations (id, account_id, client_id, date, invoice_id, document)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(prestation.id)
        .bind(account.account_id)
        .bind(prestation.client_id)
        .bind(prestation.date)
        .bind(prestation.invoice_id)
        .bind(Json(prestation))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_prestation(&self, account: &AccountContext, id: Uuid) -> Result<Option<Prestation>> {
        let row: Option<Json<Prestation>> = sqlx::query_scalar(
            "SELECT document FROM prestations WHERE id = $1 AND account_id = $2",
        )
        .bind(id)
        .bind(account.account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(prestation)| prestation))
    }

    async fn list_prestations(
        &self,
        account: &AccountContext,
        period: Period,
        client_id: Option<Uuid>,
    ) -> Result<Vec<Prestation>> {
        let (start, end) = period.bounds()?;
        let rows: Vec<Json<Prestation>> = sqlx::query_scalar(
            r#"
            SELECT document FROM prestations
            WHERE account_id = $1 AND date >= $2 AND date < $3
              AND ($4::uuid IS NULL OR client_id = $4)
            ORDER BY date, id
            "#,
        )
        .bind(account.account_id)
        .bind(start)
        .bind(end)
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(prestation)| prestation).collect())
    }

    #[instrument(skip(self, prestation), fields(prestation_id = %prestation.id))]
    async fn update_prestation(&self, account: &AccountContext, prestation: &Prestation) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        lock_mutable_prestation(&mut tx, account, prestation.id).await?;

        let mut next = prestation.clone();
        next.invoice_id = None;
        next.invoice_paid = false;
        upsert_prestation_row(&mut tx, account, &next).await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_prestation(&self, account: &AccountContext, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        lock_mutable_prestation(&mut tx, account, id).await?;

        sqlx::query("DELETE FROM prestations WHERE id = $1 AND account_id = $2")
            .bind(id)
            .bind(account.account_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_invoice(&self, account: &AccountContext, id: Uuid) -> Result<Option<Invoice>> {
        let row: Option<Json<Invoice>> =
            sqlx::query_scalar("SELECT document FROM invoices WHERE id = $1 AND account_id = $2")
                .bind(id)
                .bind(account.account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|Json(invoice)| invoice))
    }

    async fn list_invoices(&self, account: &AccountContext) -> Result<Vec<Invoice>> {
        let rows: Vec<Json<Invoice>> = sqlx::query_scalar(
            "SELECT document FROM invoices WHERE account_id = $1 ORDER BY invoice_number",
        )
        .bind(account.account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(invoice)| invoice).collect())
    }

    #[instrument(skip(self, invoice), fields(invoice_number = invoice.invoice_number))]
    async fn commit_generated_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<Invoice> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = invoice.prestations.iter().map(|p| p.id).collect();
        let rows: Vec<(Uuid, Json<Prestation>)> = sqlx::query_as(
            "SELECT id, document FROM prestations WHERE account_id = $1 AND id = ANY($2) FOR UPDATE",
        )
        .bind(account.account_id)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;
        let stored: HashMap<Uuid, Prestation> =
            rows.into_iter().map(|(id, Json(p))| (id, p)).collect();

        if invoice.claims_period() {
            let taken: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM invoices
                    WHERE account_id = $1 AND client_id = $2
                      AND period_year = $3 AND period_month = $4 AND claims_period
                )
                "#,
            )
            .bind(account.account_id)
            .bind(invoice.client_id)
            .bind(invoice.period.year)
            .bind(invoice.period.month as i32)
            .fetch_one(&mut *tx)
            .await?;
            if taken {
                return Err(BillingError::DuplicatePeriod {
                    client_id: invoice.client_id,
                    period: invoice.period,
                });
            }
        }

        for line in &invoice.prestations {
            let current = stored
                .get(&line.id)
                .ok_or_else(|| BillingError::not_found("prestation", line.id))?;
            current.ensure_mutable()?;
            let unattached = Prestation {
                invoice_id: None,
                invoice_paid: false,
                ..line.clone()
            };
            if *current != unattached {
                return Err(BillingError::Stale {
                    entity: "prestation",
                    id: line.id,
                });
            }
        }

        let stored = insert_invoice_row(&mut tx, account, invoice).await?;
        for line in &invoice.prestations {
            upsert_prestation_row(&mut tx, account, line).await?;
        }

        tx.commit().await?;
        Ok(stored)
    }

    #[instrument(skip(self, invoice), fields(invoice_number = invoice.invoice_number))]
    async fn update_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<Invoice> {
        let mut tx = self.pool.begin().await?;
        let stored = update_invoice_row(&mut tx, account, invoice).await?;

        if let Some(avoir) = &stored.avoir {
            sqlx::query(
                r#"
                INSERT INTO avoirs (account_id, numero, invoice_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (invoice_id) DO NOTHING
                "#,
            )
            .bind(account.account_id)
            .bind(avoir.numero)
            .bind(stored.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_conflict(e, &stored))?;
        }

        sqlx::query(
            r#"
            UPDATE prestations
            SET document = jsonb_set(document, '{invoicePaid}', to_jsonb($3::boolean))
            WHERE invoice_id = $1 AND account_id = $2
            "#,
        )
        .bind(stored.id)
        .bind(account.account_id)
        .bind(stored.status == InvoiceStatus::Paid)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    #[instrument(skip(self, invoice), fields(invoice_number = invoice.invoice_number))]
    async fn delete_draft_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        lock_version(&mut tx, account, invoice).await?;

        let release = if invoice.duplicated_from.is_some() {
            // Copied lines only exist through the duplicate
            "DELETE FROM prestations WHERE invoice_id = $1 AND account_id = $2"
        } else {
            r#"
            UPDATE prestations
            SET invoice_id = NULL,
                document = document || '{"invoiceId": null, "invoicePaid": false}'::jsonb
            WHERE invoice_id = $1 AND account_id = $2
            "#
        };

        sqlx::query(release)
            .bind(invoice.id)
            .bind(account.account_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM invoices WHERE id = $1 AND account_id = $2")
            .bind(invoice.id)
            .bind(account.account_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(original = outcome.original.invoice_number))]
    async fn commit_rectification(
        &self,
        account: &AccountContext,
        outcome: &RectificationOutcome,
    ) -> Result<(Invoice, Invoice)> {
        let mut tx = self.pool.begin().await?;

        let original = update_invoice_row(&mut tx, account, &outcome.original).await?;
        let rectification = insert_invoice_row(&mut tx, account, &outcome.rectification).await?;
        for line in &outcome.rectification.prestations {
            upsert_prestation_row(&mut tx, account, line).await?;
        }

        tx.commit().await?;
        Ok((original, rectification))
    }

    #[instrument(skip(self, invoice), fields(invoice_number = invoice.invoice_number))]
    async fn insert_derived_invoice(&self, account: &AccountContext, invoice: &Invoice) -> Result<Invoice> {
        let mut tx = self.pool.begin().await?;

        let stored = insert_invoice_row(&mut tx, account, invoice).await?;
        for line in &invoice.prestations {
            upsert_prestation_row(&mut tx, account, line).await?;
        }

        tx.commit().await?;
        Ok(stored)
    }

    async fn list_overdue_candidates(&self, today: NaiveDate) -> Result<Vec<(AccountContext, Invoice)>> {
        let rows: Vec<(Uuid, Json<Invoice>)> = sqlx::query_as(
            r#"
            SELECT account_id, document FROM invoices
            WHERE status IN ('unpaid', 'overdue')
              AND is_sent_to_client AND NOT locked
              AND date_echeance < $1
            ORDER BY date_echeance
            "#,
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(account_id, Json(invoice))| (AccountContext::new(account_id), invoice))
            .collect())
    }
}
