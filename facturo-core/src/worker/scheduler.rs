use chrono::{Days, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{error, info};

use crate::models::Invoice;
use crate::service::BillingService;

/// Job scheduler for the overdue sweep.
///
/// Polls for sent invoices past their due date and applies
/// `reminder-elapsed` to them through the billing service, at most once
/// per reminder interval per invoice.
#[derive(Clone)]
pub struct JobScheduler {
    service: BillingService,

    /// Polling interval in seconds
    poll_interval_seconds: u64,

    /// Minimum days between two reminders on one invoice
    reminder_interval_days: u32,

    /// Whether the scheduler is running (wrapped in Arc for sharing)
    running: Arc<RwLock<bool>>,
}

/// Whether `invoice` should receive a new reminder on `today`.
fn reminder_due(invoice: &Invoice, today: NaiveDate, interval_days: u32) -> bool {
    match invoice.rappels.last() {
        None => true,
        Some(last) => last
            .date
            .checked_add_days(Days::new(u64::from(interval_days)))
            .map_or(false, |next| today >= next),
    }
}

impl JobScheduler {
    /// Creates a new job scheduler.
    ///
    /// # Arguments
    ///
    /// * `service` - Billing service the reminders go through
    /// * `poll_interval_seconds` - How often to poll for overdue invoices (default: 60)
    /// * `reminder_interval_days` - Spacing between reminders on one invoice
    ///
    /// # Returns
    ///
    /// Returns a new `JobScheduler` instance.
    pub fn new(service: BillingService, poll_interval_seconds: Option<u64>, reminder_interval_days: u32) -> Self {
        Self {
            service,
            poll_interval_seconds: poll_interval_seconds.unwrap_or(60),
            reminder_interval_days,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Starts the scheduler loop.
    ///
    /// Runs until [`JobScheduler::stop`] is called. A failed sweep is
    /// logged and retried on the next tick.
    pub async fn start(&self) -> Result<(), anyhow::Error> {
        *self.running.write().await = true;
        info!(
            "JobScheduler started with poll interval: {} seconds",
            self.poll_interval_seconds
        );

        while *self.running.read().await {
            match self.poll_and_process(Utc::now().date_naive()).await {
                Ok(count) => {
                    if count > 0 {
                        info!("Recorded {} reminder(s)", count);
                    }
                }
                Err(e) => {
                    error!("Error in scheduler loop: {}", e);
                }
            }

            sleep(Duration::from_secs(self.poll_interval_seconds)).await;
        }

        info!("JobScheduler stopped");
        Ok(())
    }

    /// Stops the scheduler loop after the current iteration.
    pub async fn stop(&self) {
        info!("Stopping JobScheduler...");
        *self.running.write().await = false;
    }

    /// Runs one sweep for `today`.
    ///
    /// # Returns
    ///
    /// Returns the number of reminders recorded. Individual failures
    /// (for instance an invoice paid concurrently) are logged and skipped.
    pub async fn poll_and_process(&self, today: NaiveDate) -> Result<usize, anyhow::Error> {
        let candidates = self.service.store().list_overdue_candidates(today).await?;

        let due: Vec<_> = candidates
            .into_iter()
            .filter(|(_, invoice)| reminder_due(invoice, today, self.reminder_interval_days))
            .collect();
        if due.is_empty() {
            return Ok(0);
        }

        info!("Found {} overdue invoice(s) to remind", due.len());

        let mut processed = 0;
        for (account, invoice) in due {
            match self.service.record_reminder(&account, invoice.id, today).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    error!(
                        "Failed to record reminder for invoice {}: {}",
                        invoice.invoice_number, e
                    );
                }
            }
        }

        Ok(processed)
    }
}
