use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::models::BillingPeriod;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

#[derive(Debug, Error)]
#[error("malformed gateway event: {0}")]
pub struct MalformedEvent(#[from] serde_json::Error);

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// A gateway field that is either an id or the expanded object carrying it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Payment,
    Subscription,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionMetadata {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub mode: SessionMode,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub amount_total: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl GatewaySubscription {
    /// Billing period from the first item, falling back to the top-level
    /// fields older API versions still send.
    pub fn period(&self) -> Option<BillingPeriod> {
        let (start, end) = match self.items.data.first() {
            Some(SubscriptionItem {
                current_period_start: Some(start),
                current_period_end: Some(end),
            }) => (*start, *end),
            _ => (self.current_period_start?, self.current_period_end?),
        };
        Some(BillingPeriod {
            start: unix_time(start)?,
            end: unix_time(end)?,
        })
    }
}

/// Internal form of the gateway events this service acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    CheckoutCompleted(CheckoutSession),
    SubscriptionUpdated(GatewaySubscription),
    SubscriptionDeleted(GatewaySubscription),
    /// Any event type not handled here; accepted and ignored.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub id: String,
    pub event_type: String,
    pub event: GatewayEvent,
}

/// key: webhook-event-parse -> gateway wire format to internal variants
///
/// The envelope must be well formed for every event. The payload object is
/// validated only for event types that are acted on.
pub fn parse_event(payload: &[u8]) -> Result<ParsedEvent, MalformedEvent> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    let object = envelope.data.object;

    let event = match envelope.event_type.as_str() {
        CHECKOUT_COMPLETED => GatewayEvent::CheckoutCompleted(serde_json::from_value(object)?),
        SUBSCRIPTION_UPDATED => GatewayEvent::SubscriptionUpdated(serde_json::from_value(object)?),
        SUBSCRIPTION_DELETED => GatewayEvent::SubscriptionDeleted(serde_json::from_value(object)?),
        _ => GatewayEvent::Other,
    };

    Ok(ParsedEvent {
        id: envelope.id,
        event_type: envelope.event_type,
        event,
    })
}

fn unix_time(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
