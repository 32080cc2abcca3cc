use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::billing::PeriodSummary;
use crate::error::BillingError;
use crate::lifecycle::{AvoirRequest, PaymentRequest, RectificationOutcome, RectificationRequest};
use crate::models::{
    AccountContext, Client, CreateClient, Invoice, InvoiceDocument, Period, Prestation,
    PrestationDraft,
};
use crate::service::BillingService;

type ApiResult<T> = Result<T, BillingError>;

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "facturo-core",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// -----------------------------------------------------------------------------
// Clients
// -----------------------------------------------------------------------------

pub async fn create_client(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Json(input): Json<CreateClient>,
) -> ApiResult<(StatusCode, Json<Client>)> {
    let client = service.create_client(&account, input).await?;
    Ok((StatusCode::CREATED, Json(client)))
}

pub async fn list_clients(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
) -> ApiResult<Json<Vec<Client>>> {
    Ok(Json(service.list_clients(&account).await?))
}

pub async fn get_client(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Client>> {
    Ok(Json(service.get_client(&account, id).await?))
}

pub async fn delete_client(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    service.delete_client(&account, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -----------------------------------------------------------------------------
// Prestations
// -----------------------------------------------------------------------------

pub async fn create_prestation(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Json(draft): Json<PrestationDraft>,
) -> ApiResult<(StatusCode, Json<Prestation>)> {
    let prestation = service.create_prestation(&account, draft).await?;
    Ok((StatusCode::CREATED, Json(prestation)))
}

pub async fn get_prestation(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Prestation>> {
    Ok(Json(service.get_prestation(&account, id).await?))
}

pub async fn update_prestation(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
    Json(draft): Json<PrestationDraft>,
) -> ApiResult<Json<Prestation>> {
    Ok(Json(service.update_prestation(&account, id, draft).await?))
}

pub async fn delete_prestation(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    service.delete_prestation(&account, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryQuery {
    pub year: i32,
    pub month: u32,
    pub client_id: Option<Uuid>,
}

pub async fn month_summary(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<Json<PeriodSummary>> {
    let period = Period::new(query.year, query.month)?;
    Ok(Json(service.month_summary(&account, period, query.client_id).await?))
}

// -----------------------------------------------------------------------------
// Invoices
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInvoiceRequest {
    pub client_id: Uuid,
    pub year: i32,
    pub month: u32,
    /// Defaults to today
    pub date_facture: Option<NaiveDate>,
}

pub async fn generate_invoice(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Json(request): Json<GenerateInvoiceRequest>,
) -> ApiResult<(StatusCode, Json<Invoice>)> {
    let period = Period::new(request.year, request.month)?;
    let date_facture = request.date_facture.unwrap_or_else(today);
    let invoice = service
        .generate_invoice(&account, request.client_id, period, date_facture)
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn list_invoices(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
) -> ApiResult<Json<Vec<Invoice>>> {
    Ok(Json(service.list_invoices(&account).await?))
}

pub async fn get_invoice(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Invoice>> {
    Ok(Json(service.get_invoice(&account, id).await?))
}

pub async fn invoice_document(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<InvoiceDocument>> {
    Ok(Json(service.invoice_document(&account, id).await?))
}

pub async fn rectification_chain(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Invoice>>> {
    Ok(Json(service.rectification_chain(&account, id).await?))
}

pub async fn delete_invoice(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    service.delete_invoice(&account, id, today()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_as_sent(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Invoice>> {
    Ok(Json(service.mark_as_sent(&account, id, today()).await?))
}

pub async fn record_payment(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<PaymentRequest>,
) -> ApiResult<Json<Invoice>> {
    Ok(Json(service.record_payment(&account, id, request, today()).await?))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub motif: String,
}

pub async fn cancel_invoice(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<Invoice>> {
    Ok(Json(
        service
            .cancel_invoice(&account, id, &request.motif, today())
            .await?,
    ))
}

pub async fn rectify_invoice(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<RectificationRequest>,
) -> ApiResult<(StatusCode, Json<RectificationOutcome>)> {
    let outcome = service.rectify_invoice(&account, id, request, today()).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn create_avoir(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
    Json(request): Json<AvoirRequest>,
) -> ApiResult<(StatusCode, Json<Invoice>)> {
    let invoice = service.create_avoir(&account, id, request, today()).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn duplicate_invoice(
    State(service): State<BillingService>,
    Extension(account): Extension<AccountContext>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Invoice>)> {
    let invoice = service.duplicate_invoice(&account, id, today()).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}
