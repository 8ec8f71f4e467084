use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::adapters::{CheckoutRequest, PaymentGateway};
use super::ledger::CreditLedger;
use super::models::{LedgerEntry, PlanSummary, TransactionKind};
use super::plans::PlanCatalog;
use super::store::LedgerFilter;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

/// key: billing-api -> rest endpoints
pub async fn list_plan_catalog(
    Extension(catalog): Extension<Arc<PlanCatalog>>,
) -> Json<PlanCatalog> {
    Json(catalog.as_ref().clone())
}

pub async fn current_plan(
    Extension(ledger): Extension<CreditLedger>,
    AuthUser { account_id, .. }: AuthUser,
) -> AppResult<Json<PlanSummary>> {
    Ok(Json(ledger.plan_summary(account_id).await?))
}

pub async fn purchase(
    Extension(catalog): Extension<Arc<PlanCatalog>>,
    Extension(gateway): Extension<Arc<dyn PaymentGateway>>,
    AuthUser {
        account_id, email, ..
    }: AuthUser,
    Json(payload): Json<PurchaseRequest>,
) -> AppResult<Json<PurchaseResponse>> {
    let (price_id, mode) = catalog
        .checkout_offer(&payload.package_id)
        .ok_or_else(|| AppError::BadRequest("Pacote invalido".into()))?;

    let session = gateway
        .create_checkout_session(&CheckoutRequest {
            account_id,
            email,
            price_id: price_id.to_string(),
            mode,
        })
        .await?;
    info!(
        %account_id,
        package = %payload.package_id,
        mode = mode.as_str(),
        session = %session.id,
        "checkout session created"
    );

    let url = session
        .url
        .ok_or_else(|| AppError::BadGateway("checkout session without url".into()))?;
    Ok(Json(PurchaseResponse { url }))
}

pub async fn list_transactions(
    Extension(ledger): Extension<CreditLedger>,
    AuthUser { account_id, .. }: AuthUser,
    Query(query): Query<TransactionQuery>,
) -> AppResult<Json<Vec<LedgerEntry>>> {
    let filter = LedgerFilter {
        kind: query.kind,
        limit: query.limit,
    };
    Ok(Json(ledger.history(account_id, &filter).await?))
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    #[serde(alias = "packageId")]
    pub package_id: String,
}

#[derive(Debug, Serialize)]
pub struct PurchaseResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    #[serde(default)]
    pub kind: Option<TransactionKind>,
    #[serde(default)]
    pub limit: Option<i64>,
}
