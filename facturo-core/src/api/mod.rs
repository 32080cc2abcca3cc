//! Internal HTTP/JSON boundary exposing the billing operations.

pub mod error;
pub mod handlers;

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{jwt_middleware, AuthKeys};
use crate::service::BillingService;


/// Application state shared with route handlers.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub service: BillingService,
    pub auth: AuthKeys,
}

/// Creates the application router.
///
/// Everything under `/api` requires a bearer token; the account it names
/// scopes every operation.
///
/// # Arguments
///
/// * `state` - Billing service and token keys
///
/// # Returns
///
/// Returns a configured Axum Router.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/clients", post(handlers::create_client).get(handlers::list_clients))
        .route(
            "/clients/:id",
            get(handlers::get_client).delete(handlers::delete_client),
        )
        .route("/prestations", post(handlers::create_prestation))
        .route(
            "/prestations/:id",
            get(handlers::get_prestation)
                .put(handlers::update_prestation)
                .delete(handlers::delete_prestation),
        )
        .route("/summary", get(handlers::month_summary))
        .route(
            "/invoices",
            post(handlers::generate_invoice).get(handlers::list_invoices),
        )
        .route(
            "/invoices/:id",
            get(handlers::get_invoice).delete(handlers::delete_invoice),
        )
        .route("/invoices/:id/document", get(handlers::invoice_document))
        .route("/invoices/:id/chain", get(handlers::rectification_chain))
        .route("/invoices/:id/send", post(handlers::mark_as_sent))
        .route("/invoices/:id/payments", post(handlers::record_payment))
        .route("/invoices/:id/cancel", post(handlers::cancel_invoice))
        .route("/invoices/:id/rectifications", post(handlers::rectify_invoice))
        .route("/invoices/:id/avoir", post(handlers::create_avoir))
        .route("/invoices/:id/duplicate", post(handlers::duplicate_invoice))
        .route_layer(middleware::from_fn_with_state(state.clone(), jwt_middleware));

    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
