use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::billing::calculator::{checked_sum, round_currency};
use crate::error::{BillingError, Result};
use crate::models::period::Period;
use crate::models::prestation::Prestation;

/// Invoicing state of a prestation, used to gate edit/delete affordances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoicingState {
    NotInvoiced,
    InvoicedUnpaid,
    InvoicedPaid,
}

impl InvoicingState {
    pub fn of(prestation: &Prestation) -> Self {
        match (prestation.invoice_id, prestation.invoice_paid) {
            (None, _) => InvoicingState::NotInvoiced,
            (Some(_), false) => InvoicingState::InvoicedUnpaid,
            (Some(_), true) => InvoicingState::InvoicedPaid,
        }
    }
}

/// Prestations of one client on one day.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientGroup {
    pub client_id: Uuid,
    pub prestations: Vec<Prestation>,
    pub total: Decimal,
    pub duration: i64,
}

/// All prestations of one day, grouped by client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayGroup {
    pub date: NaiveDate,
    pub clients: Vec<ClientGroup>,
    pub total: Decimal,
    pub duration: i64,
}

/// Date-grouped view of a period with its totals.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    pub period: Period,
    pub client_id: Option<Uuid>,
    pub days: Vec<DayGroup>,
    pub total: Decimal,
    pub duration: i64,
    pub partition: Partition,
}

/// Prestation ids split by invoicing state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub invoiced_paid: Vec<Uuid>,
    pub invoiced_unpaid: Vec<Uuid>,
    pub not_invoiced: Vec<Uuid>,
}

pub fn partition<'a>(prestations: impl IntoIterator<Item = &'a Prestation>) -> Partition {
    let mut partition = Partition::default();
    for prestation in prestations {
        let bucket = match InvoicingState::of(prestation) {
            InvoicingState::InvoicedPaid => &mut partition.invoiced_paid,
            InvoicingState::InvoicedUnpaid => &mut partition.invoiced_unpaid,
            InvoicingState::NotInvoiced => &mut partition.not_invoiced,
        };
        bucket.push(prestation.id);
    }
    partition
}

/// Groups by date then client, ordered by date.
///
/// Group totals are accumulated on unrounded line amounts and rounded once.
/// The period total is the sum of the rounded day totals, so the days of a
/// summary always add up to its total.
pub fn summarize(prestations: &[Prestation], period: Period, client_id: Option<Uuid>) -> Result<PeriodSummary> {
    let selected: Vec<&Prestation> = prestations
        .iter()
        .filter(|p| period.contains(p.date))
        .filter(|p| client_id.map_or(true, |c| p.client_id == c))
        .collect();

    let mut by_day: BTreeMap<NaiveDate, BTreeMap<Uuid, Vec<Prestation>>> = BTreeMap::new();
    for prestation in &selected {
        by_day
            .entry(prestation.date)
            .or_default()
            .entry(prestation.client_id)
            .or_default()
            .push((*prestation).clone());
    }

    let mut days = Vec::with_capacity(by_day.len());
    for (date, clients) in by_day {
        let mut raw_day_total = Decimal::ZERO;
        let mut day_duration = 0;
        let mut groups = Vec::with_capacity(clients.len());
        for (client_id, prestations) in clients {
            let raw_total = checked_sum(
                prestations
                    .iter()
                    .map(Prestation::raw_total)
                    .collect::<Result<Vec<_>>>()?,
            )?;
            let duration = total_duration(prestations.iter().map(|p| p.duration))?;
            raw_day_total = checked_sum([raw_day_total, raw_total])?;
            day_duration = total_duration([day_duration, duration])?;
            groups.push(ClientGroup {
                client_id,
                prestations,
                total: round_currency(raw_total),
                duration,
            });
        }
        days.push(DayGroup {
            date,
            clients: groups,
            total: round_currency(raw_day_total),
            duration: day_duration,
        });
    }

    Ok(PeriodSummary {
        period,
        client_id,
        total: checked_sum(days.iter().map(|d| d.total))?,
        duration: total_duration(days.iter().map(|d| d.duration))?,
        days,
        partition: partition(selected),
    })
}

fn total_duration(durations: impl IntoIterator<Item = i64>) -> Result<i64> {
    durations.into_iter().try_fold(0i64, |acc, minutes| {
        acc.checked_add(minutes)
            .ok_or_else(|| BillingError::validation("duration", "duration out of range"))
    })
}

/// Flattens a date-grouped view back into its prestations, in view order.
pub fn flatten(days: &[DayGroup]) -> Vec<Prestation> {
    days.iter()
        .flat_map(|day| day.clients.iter())
        .flat_map(|group| group.prestations.iter().cloned())
        .collect()
}

/// Selects what a new invoice for `client_id` over `period` would contain.
///
/// An empty selection is an error: empty invoices are never generated.
pub fn select_for_invoice(
    prestations: &[Prestation],
    client_id: Uuid,
    period: Period,
) -> Result<Vec<Prestation>> {
    let mut selected: Vec<Prestation> = prestations
        .iter()
        .filter(|p| p.client_id == client_id && period.contains(p.date) && p.invoice_id.is_none())
        .cloned()
        .collect();

    if selected.is_empty() {
        return Err(BillingError::NoPrestationsFound { client_id, period });
    }

    selected.sort_by_key(|p| p.date);
    Ok(selected)
}
