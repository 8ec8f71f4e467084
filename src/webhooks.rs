use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
};
use tracing::error;

use crate::billing::{WebhookError, WebhookReconciler, SIGNATURE_HEADER};

/// key: webhooks-billing -> payment gateway entrypoint
///
/// 400 only for a bad signature or an unparseable event. Store and gateway
/// failures answer 503 so the gateway redelivers; everything else is 200.
pub async fn payment_webhook(
    Extension(reconciler): Extension<Arc<WebhookReconciler>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    match reconciler.handle(&body, signature).await {
        Ok(_) => (StatusCode::OK, "ok"),
        Err(WebhookError::Signature(_)) => (StatusCode::BAD_REQUEST, "Webhook signature invalida"),
        Err(WebhookError::Malformed(_)) => (StatusCode::BAD_REQUEST, "Webhook payload invalido"),
        Err(err @ (WebhookError::Gateway(_) | WebhookError::Billing(_))) => {
            error!(?err, "payment webhook could not be applied; gateway will retry");
            (StatusCode::SERVICE_UNAVAILABLE, "retry later")
        }
    }
}
