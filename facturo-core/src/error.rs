use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::period::Period;

/// Number series allocated by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Series {
    Invoice,
    Avoir,
}

impl std::fmt::Display for Series {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Series::Invoice => write!(f, "invoice"),
            Series::Avoir => write!(f, "avoir"),
        }
    }
}

/// Error category surfaced to callers.
///
/// Each kind maps to exactly one human-readable message category on the
/// caller's side; the engine itself never formats localized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    ImmutablePrestation,
    InvalidStateTransition,
    AmountExceedsOriginal,
    NoPrestationsFound,
    SequenceAllocationConflict,
    DuplicatePeriod,
    Stale,
    NotFound,
    Internal,
}

/// Errors returned by every engine operation.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("prestation {prestation_id} belongs to invoice {invoice_id} and cannot be modified")]
    ImmutablePrestation {
        prestation_id: Uuid,
        invoice_id: Uuid,
    },

    #[error("invoice {invoice_number} ({status}) does not allow {event}")]
    InvalidStateTransition {
        invoice_number: i64,
        status: String,
        event: String,
        reason: &'static str,
    },

    #[error("avoir amount {montant} exceeds invoice gross amount {montant_ht}")]
    AmountExceedsOriginal {
        montant: rust_decimal::Decimal,
        montant_ht: rust_decimal::Decimal,
    },

    #[error("no uninvoiced prestations for client {client_id} in {period}")]
    NoPrestationsFound { client_id: Uuid, period: Period },

    #[error("{series} number {number} collided with an existing document")]
    SequenceAllocationConflict { series: Series, number: i64 },

    #[error("client {client_id} already has an invoice for {period}")]
    DuplicatePeriod { client_id: Uuid, period: Period },

    #[error("{entity} {id} was modified concurrently")]
    Stale { entity: &'static str, id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BillingError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        BillingError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        BillingError::NotFound { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::Validation { .. } => ErrorKind::Validation,
            BillingError::ImmutablePrestation { .. } => ErrorKind::ImmutablePrestation,
            BillingError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            BillingError::AmountExceedsOriginal { .. } => ErrorKind::AmountExceedsOriginal,
            BillingError::NoPrestationsFound { .. } => ErrorKind::NoPrestationsFound,
            BillingError::SequenceAllocationConflict { .. } => {
                ErrorKind::SequenceAllocationConflict
            }
            BillingError::DuplicatePeriod { .. } => ErrorKind::DuplicatePeriod,
            BillingError::Stale { .. } => ErrorKind::Stale,
            BillingError::NotFound { .. } => ErrorKind::NotFound,
            BillingError::Database(_) | BillingError::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, BillingError>;
