use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;

use crate::models::invoice::TaxRates;

/// Default URSSAF withholding for liberal professions (24.6%)
pub const DEFAULT_URSSAF_RATE: &str = "0.246";

/// Default payment term in days
pub const DEFAULT_PAYMENT_TERM_DAYS: u32 = 30;

/// Days between two reminders on the same overdue invoice
pub const DEFAULT_REMINDER_INTERVAL_DAYS: u32 = 7;

/// Billing parameters injected into the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BillingConfig {
    pub rates: TaxRates,
    pub payment_term_days: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            rates: TaxRates {
                urssaf_rate: Decimal::new(246, 3),
                tva_rate: Decimal::ZERO,
            },
            payment_term_days: DEFAULT_PAYMENT_TERM_DAYS,
        }
    }
}

/// Process configuration read from the environment (after `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub worker_poll_interval_seconds: u64,
    pub reminder_interval_days: u32,
    pub billing: BillingConfig,
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).map_err(|_| anyhow::anyhow!("{} must be set", name))
}

fn parsed<T: FromStr>(name: &str, default: &str) -> anyhow::Result<T> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("Invalid {}: {}", name, raw))
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// `DATABASE_URL` and `JWT_SECRET` are required; everything else has a
    /// default.
    pub fn from_env() -> anyhow::Result<Self> {
        let urssaf_rate: Decimal = parsed("URSSAF_RATE", DEFAULT_URSSAF_RATE)?;
        let tva_rate: Decimal = parsed("TVA_RATE", "0")?;
        for (name, rate) in [("URSSAF_RATE", urssaf_rate), ("TVA_RATE", tva_rate)] {
            if rate.is_sign_negative() || rate >= Decimal::ONE {
                return Err(anyhow::anyhow!("{} must be a fraction in [0, 1): {}", name, rate));
            }
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS", "10")?,
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: parsed("SERVER_PORT", "3000")?,
            jwt_secret: required("JWT_SECRET")?,
            worker_poll_interval_seconds: parsed("WORKER_POLL_INTERVAL_SECONDS", "60")?,
            reminder_interval_days: parsed(
                "REMINDER_INTERVAL_DAYS",
                &DEFAULT_REMINDER_INTERVAL_DAYS.to_string(),
            )?,
            billing: BillingConfig {
                rates: TaxRates {
                    urssaf_rate,
                    tva_rate,
                },
                payment_term_days: parsed(
                    "PAYMENT_TERM_DAYS",
                    &DEFAULT_PAYMENT_TERM_DAYS.to_string(),
                )?,
            },
        })
    }
}
