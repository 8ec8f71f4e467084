use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};

use crate::billing::{
    self, BillingStore, CreditLedger, PaymentGateway, PlanCatalog, RateLimiter,
    SignatureVerifier, SubscriptionStateMachine, UsagePolicyEngine, WebhookReconciler,
};
use crate::provider::ModelProvider;
use crate::{chat, webhooks};

pub async fn root() -> &'static str {
    "Metered Gateway API"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/user/plan", get(billing::billing_current_plan))
        .route("/api/billing/plans", get(billing::billing_list_plan_catalog))
        .route("/api/credits/purchase", post(billing::billing_purchase))
        .route(
            "/api/credits/transactions",
            get(billing::billing_list_transactions),
        )
        .route("/api/chat", post(chat::send_message))
        .route("/api/webhooks/stripe", post(webhooks::payment_webhook))
}

/// Collaborators built once at start-up and handed to the handlers.
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<PlanCatalog>,
    pub ledger: CreditLedger,
    pub usage: UsagePolicyEngine,
    pub gateway: Arc<dyn PaymentGateway>,
    pub reconciler: Arc<WebhookReconciler>,
    pub provider: Arc<dyn ModelProvider>,
}

impl AppServices {
    pub fn assemble(
        store: Arc<dyn BillingStore>,
        limiter: RateLimiter,
        catalog: PlanCatalog,
        verifier: SignatureVerifier,
        gateway: Arc<dyn PaymentGateway>,
        provider: Arc<dyn ModelProvider>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let ledger = CreditLedger::new(store.clone());
        let usage = UsagePolicyEngine::new(limiter, ledger.clone());
        let reconciler = Arc::new(WebhookReconciler::new(
            verifier,
            gateway.clone(),
            catalog.clone(),
            ledger.clone(),
            SubscriptionStateMachine::new(store),
        ));

        Self {
            catalog,
            ledger,
            usage,
            gateway,
            reconciler,
            provider,
        }
    }
}

/// Full application router without the metrics layer.
pub fn app(services: AppServices) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(services.catalog))
        .layer(Extension(services.ledger))
        .layer(Extension(services.usage))
        .layer(Extension(services.gateway))
        .layer(Extension(services.reconciler))
        .layer(Extension(services.provider))
}
