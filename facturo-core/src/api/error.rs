use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::error::{BillingError, ErrorKind};

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::AmountExceedsOriginal | ErrorKind::NoPrestationsFound => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::ImmutablePrestation
        | ErrorKind::InvalidStateTransition
        | ErrorKind::DuplicatePeriod
        | ErrorKind::SequenceAllocationConflict
        | ErrorKind::Stale => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);

        // Infrastructure details stay in the log
        let message = if kind == ErrorKind::Internal {
            error!(error = %self, "Request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let err = BillingError::ImmutablePrestation {
            prestation_id: Uuid::nil(),
            invoice_id: Uuid::nil(),
        };
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let err = BillingError::validation("motif", "required");
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);

        let err = BillingError::not_found("invoice", Uuid::nil());
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = BillingError::Internal(anyhow::anyhow!("pool closed"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
