#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use metered_gateway::billing::{
    CheckoutRequest, CheckoutSessionCreated, GatewayError, GatewaySubscription,
    MemoryBillingStore, MemoryCounterStore, PaymentGateway, PlanCatalog, PriceIds, RateLimiter,
    SignatureVerifier,
};
use metered_gateway::provider::{Completion, ModelProvider, PromptMessage};
use metered_gateway::{app, AppServices};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "secret";
pub const WEBHOOK_SECRET: &str = "whsec_integration";

/// Gateway double: fixed line items per session, one subscription fixture, and
/// a record of every checkout it was asked to create.
#[derive(Default)]
pub struct FakeGateway {
    pub checkouts: Mutex<Vec<CheckoutRequest>>,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSessionCreated, GatewayError> {
        self.checkouts.lock().unwrap().push(request.clone());
        Ok(CheckoutSessionCreated {
            id: "cs_created".to_string(),
            url: Some("https://checkout.example/cs_created".to_string()),
        })
    }

    async fn checkout_price_id(&self, session_id: &str) -> Result<Option<String>, GatewayError> {
        Ok(match session_id {
            "cs_small" => Some("price_small".to_string()),
            "cs_large" => Some("price_large".to_string()),
            _ => None,
        })
    }

    async fn subscription(
        &self,
        subscription_id: &str,
    ) -> Result<GatewaySubscription, GatewayError> {
        Ok(serde_json::from_value(json!({
            "id": subscription_id,
            "status": "active",
            "customer": "cus_test",
            "items": { "data": [
                { "current_period_start": 1_760_000_000, "current_period_end": 1_762_592_000 }
            ]}
        }))
        .unwrap())
    }
}

/// Model double that answers or fails on demand.
pub struct FakeProvider {
    pub fail: bool,
}

#[async_trait]
impl ModelProvider for FakeProvider {
    async fn complete(&self, messages: &[PromptMessage]) -> anyhow::Result<Completion> {
        if self.fail {
            return Err(anyhow!("upstream model timed out"));
        }
        Ok(Completion {
            text: format!("eco: {}", messages.last().map(|m| m.content.as_str()).unwrap_or("")),
            total_tokens: Some(12),
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryBillingStore>,
    pub gateway: Arc<FakeGateway>,
}

pub fn catalog(daily_limit: u64) -> PlanCatalog {
    PlanCatalog::standard(
        daily_limit,
        PriceIds {
            credits_small: Some("price_small".into()),
            credits_medium: Some("price_medium".into()),
            credits_large: Some("price_large".into()),
            unlimited_monthly: Some("price_unlimited".into()),
        },
    )
}

pub fn test_app(daily_limit: u64, provider_fails: bool) -> TestApp {
    std::env::set_var("JWT_SECRET", JWT_SECRET);

    let store = Arc::new(MemoryBillingStore::new());
    let gateway = Arc::new(FakeGateway::default());
    let limiter = RateLimiter::new(
        Arc::new(MemoryCounterStore::new()),
        daily_limit,
        Duration::from_secs(86_400),
        "test:free",
    );
    let services = AppServices::assemble(
        store.clone(),
        limiter,
        catalog(daily_limit),
        SignatureVerifier::new(WEBHOOK_SECRET, Duration::from_secs(300)),
        gateway.clone(),
        Arc::new(FakeProvider {
            fail: provider_fails,
        }),
    );

    TestApp {
        router: app(services),
        store,
        gateway,
    }
}

pub fn token_for(account_id: Uuid) -> String {
    let claims = json!({
        "sub": account_id,
        "email": "buyer@example.com",
        "exp": 9999999999u64
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

pub async fn send(router: &Router, request: Request<Body>) -> (u16, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status().as_u16();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
    (status, value)
}

pub fn authed_json(method: &str, uri: &str, account_id: Uuid, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", token_for(account_id)))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn authed_get(uri: &str, account_id: Uuid) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("Authorization", format!("Bearer {}", token_for(account_id)))
        .body(Body::empty())
        .unwrap()
}
