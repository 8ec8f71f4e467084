use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use super::events::GatewaySubscription;
use super::plans::CheckoutMode;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("payment gateway answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("payment gateway response missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub account_id: Uuid,
    pub email: Option<String>,
    pub price_id: String,
    pub mode: CheckoutMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSessionCreated {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// key: billing-adapter -> payment gateway calls used by checkout and webhooks
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSessionCreated, GatewayError>;

    /// Price id of the first line item of a completed checkout session.
    async fn checkout_price_id(&self, session_id: &str) -> Result<Option<String>, GatewayError>;

    async fn subscription(&self, subscription_id: &str)
        -> Result<GatewaySubscription, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct LineItemList {
    #[serde(default)]
    data: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
struct LineItem {
    #[serde(default)]
    price: Option<LineItemPrice>,
}

#[derive(Debug, Deserialize)]
struct LineItemPrice {
    id: String,
}

/// key: billing-adapter-stripe -> form-encoded REST client
#[derive(Clone)]
pub struct StripeAdapter {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
    app_url: String,
}

impl StripeAdapter {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        app_url: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            secret_key: secret_key.into(),
            app_url: app_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn read<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentGateway for StripeAdapter {
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSessionCreated, GatewayError> {
        let mut form = vec![
            ("mode", request.mode.as_str().to_string()),
            ("metadata[userId]", request.account_id.to_string()),
            ("line_items[0][price]", request.price_id.clone()),
            ("line_items[0][quantity]", "1".to_string()),
            ("payment_method_types[0]", "card".to_string()),
            (
                "success_url",
                format!("{}/chat?session_id={{CHECKOUT_SESSION_ID}}", self.app_url),
            ),
            ("cancel_url", format!("{}/pricing", self.app_url)),
        ];
        if let Some(email) = &request.email {
            form.push(("customer_email", email.clone()));
        }

        let response = self
            .client
            .post(self.endpoint("v1/checkout/sessions"))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await?;
        let session: CheckoutSessionCreated = Self::read(response).await?;
        if session.url.is_none() {
            return Err(GatewayError::MissingField("url"));
        }
        Ok(session)
    }

    async fn checkout_price_id(&self, session_id: &str) -> Result<Option<String>, GatewayError> {
        let response = self
            .client
            .get(self.endpoint(&format!("v1/checkout/sessions/{session_id}/line_items")))
            .bearer_auth(&self.secret_key)
            .query(&[("limit", "1")])
            .send()
            .await?;
        let items: LineItemList = Self::read(response).await?;
        Ok(items
            .data
            .into_iter()
            .next()
            .and_then(|item| item.price)
            .map(|price| price.id))
    }

    async fn subscription(
        &self,
        subscription_id: &str,
    ) -> Result<GatewaySubscription, GatewayError> {
        let response = self
            .client
            .get(self.endpoint(&format!("v1/subscriptions/{subscription_id}")))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        Self::read(response).await
    }
}
