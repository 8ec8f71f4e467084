use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::adapters::{GatewayError, PaymentGateway};
use super::error::BillingError;
use super::events::{
    parse_event, CheckoutSession, Expandable, GatewayEvent, MalformedEvent, ParsedEvent,
    SessionMode,
};
use super::ledger::CreditLedger;
use super::plans::PlanCatalog;
use super::signature::{SignatureError, SignatureVerifier};
use super::store::{CreditPurchase, NewSubscription, ProcessedEvent, ReconcileOutcome};
use super::subscription::SubscriptionStateMachine;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook signature rejected: {0}")]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Billing(#[from] BillingError),
}

/// Why a verified event produced no state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnhandledEventType,
    UnsupportedCheckoutMode,
    MissingAccountReference,
    UnknownPrice,
    MissingSubscriptionReference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookReceipt {
    Reconciled(ReconcileOutcome),
    Ignored(IgnoreReason),
}

/// key: billing-reconciliation -> verified gateway events into account state
///
/// Every state change goes through the billing store together with the event
/// id, so a redelivered event is reported as a duplicate instead of being
/// applied twice.
pub struct WebhookReconciler {
    verifier: SignatureVerifier,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    ledger: CreditLedger,
    subscriptions: SubscriptionStateMachine,
}

impl WebhookReconciler {
    pub fn new(
        verifier: SignatureVerifier,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        ledger: CreditLedger,
        subscriptions: SubscriptionStateMachine,
    ) -> Self {
        Self {
            verifier,
            gateway,
            catalog,
            ledger,
            subscriptions,
        }
    }

    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookReceipt, WebhookError> {
        self.handle_at(payload, signature, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookReceipt, WebhookError> {
        if let Err(err) = self.verifier.verify_at(payload, signature, now) {
            warn!(target: "audit", %err, bytes = payload.len(), "payment webhook signature rejected");
            return Err(err.into());
        }

        let parsed = parse_event(payload).map_err(|err| {
            warn!(?err, "verified payment webhook could not be parsed");
            err
        })?;
        let receipt = self.dispatch(&parsed).await?;

        info!(
            event_id = %parsed.id,
            event_type = %parsed.event_type,
            ?receipt,
            "payment webhook reconciled"
        );
        Ok(receipt)
    }

    pub async fn dispatch(&self, parsed: &ParsedEvent) -> Result<WebhookReceipt, WebhookError> {
        let event = ProcessedEvent {
            event_id: parsed.id.clone(),
            event_type: parsed.event_type.clone(),
        };

        let outcome = match &parsed.event {
            GatewayEvent::CheckoutCompleted(session) => {
                return self.checkout_completed(&event, session).await;
            }
            GatewayEvent::SubscriptionUpdated(subscription) => {
                self.subscriptions
                    .update(
                        &event,
                        &subscription.id,
                        &subscription.status,
                        subscription.period(),
                        subscription.cancel_at_period_end,
                    )
                    .await?
            }
            GatewayEvent::SubscriptionDeleted(subscription) => {
                self.subscriptions.cancel(&event, &subscription.id).await?
            }
            GatewayEvent::Other => {
                return Ok(WebhookReceipt::Ignored(IgnoreReason::UnhandledEventType));
            }
        };
        Ok(WebhookReceipt::Reconciled(outcome))
    }

    async fn checkout_completed(
        &self,
        event: &ProcessedEvent,
        session: &CheckoutSession,
    ) -> Result<WebhookReceipt, WebhookError> {
        let Some(account_id) = session
            .metadata
            .user_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            warn!(session = %session.id, "checkout session without a usable account reference");
            return Ok(WebhookReceipt::Ignored(
                IgnoreReason::MissingAccountReference,
            ));
        };

        let result = match session.mode {
            SessionMode::Payment => self.credit_purchase(event, session, account_id).await,
            SessionMode::Subscription => {
                self.subscription_checkout(event, session, account_id)
                    .await
            }
            SessionMode::Other => {
                return Ok(WebhookReceipt::Ignored(
                    IgnoreReason::UnsupportedCheckoutMode,
                ))
            }
        };

        // A paid checkout is never dropped: the error leaves the event unclaimed
        // and the gateway redelivers it once the account exists.
        if let Err(WebhookError::Billing(BillingError::AccountNotFound(missing))) = &result {
            warn!(
                account_id = %missing,
                session = %session.id,
                "checkout completed for unknown account; awaiting redelivery"
            );
        }
        result
    }

    async fn credit_purchase(
        &self,
        event: &ProcessedEvent,
        session: &CheckoutSession,
        account_id: Uuid,
    ) -> Result<WebhookReceipt, WebhookError> {
        let price_id = self.gateway.checkout_price_id(&session.id).await?;
        let Some(package) = price_id
            .as_deref()
            .and_then(|price| self.catalog.package_for_price(price))
        else {
            warn!(session = %session.id, ?price_id, "checkout price matches no credit package");
            return Ok(WebhookReceipt::Ignored(IgnoreReason::UnknownPrice));
        };

        let outcome = self
            .ledger
            .add_credits_for_event(
                event,
                CreditPurchase {
                    account_id,
                    credits: package.credits,
                    gateway_reference_id: session.id.clone(),
                    amount_minor_units: package.price_minor_units,
                },
            )
            .await?;
        Ok(WebhookReceipt::Reconciled(outcome))
    }

    async fn subscription_checkout(
        &self,
        event: &ProcessedEvent,
        session: &CheckoutSession,
        account_id: Uuid,
    ) -> Result<WebhookReceipt, WebhookError> {
        let Some(subscription_id) = session.subscription.as_ref().map(Expandable::id) else {
            warn!(session = %session.id, "subscription checkout without a subscription id");
            return Ok(WebhookReceipt::Ignored(
                IgnoreReason::MissingSubscriptionReference,
            ));
        };

        let subscription = self.gateway.subscription(subscription_id).await?;
        let outcome = self
            .subscriptions
            .activate(
                event,
                NewSubscription {
                    account_id,
                    external_subscription_id: subscription_id.to_string(),
                    external_customer_id: session
                        .customer
                        .as_ref()
                        .map(|customer| customer.id().to_string()),
                    period: subscription.period(),
                },
            )
            .await?;
        Ok(WebhookReceipt::Reconciled(outcome))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::billing::adapters::{CheckoutRequest, CheckoutSessionCreated};
    use crate::billing::events::GatewaySubscription;
    use crate::billing::memory::MemoryBillingStore;
    use crate::billing::models::SubscriptionStatus;
    use crate::billing::plans::PriceIds;
    use crate::billing::signature::signature_header;
    use crate::billing::store::{BillingStore, EffectApplied};

    const SECRET: &str = "whsec_unit";

    struct FakeGateway;

    #[async_trait]
    impl PaymentGateway for FakeGateway {
        async fn create_checkout_session(
            &self,
            _request: &CheckoutRequest,
        ) -> Result<CheckoutSessionCreated, GatewayError> {
            Err(GatewayError::MissingField("url"))
        }

        async fn checkout_price_id(
            &self,
            session_id: &str,
        ) -> Result<Option<String>, GatewayError> {
            Ok(match session_id {
                "cs_small" => Some("price_small".to_string()),
                "cs_odd" => Some("price_retired".to_string()),
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
                "items": { "data": [
                    { "current_period_start": 1_760_000_000, "current_period_end": 1_762_592_000 }
                ]}
            }))
            .expect("subscription fixture"))
        }
    }

    struct Harness {
        store: Arc<MemoryBillingStore>,
        reconciler: WebhookReconciler,
        account_id: Uuid,
    }

    fn harness(plan: &str) -> Harness {
        let store = Arc::new(MemoryBillingStore::new());
        let account_id = Uuid::new_v4();
        store.insert_account(account_id, "hook@example.com", plan, 0);

        let catalog = PlanCatalog::standard(
            20,
            PriceIds {
                credits_small: Some("price_small".into()),
                unlimited_monthly: Some("price_unlimited".into()),
                ..PriceIds::default()
            },
        );
        let reconciler = WebhookReconciler::new(
            SignatureVerifier::new(SECRET, Duration::from_secs(300)),
            Arc::new(FakeGateway),
            Arc::new(catalog),
            CreditLedger::new(store.clone()),
            SubscriptionStateMachine::new(store.clone()),
        );
        Harness {
            store,
            reconciler,
            account_id,
        }
    }

    async fn deliver(harness: &Harness, event: Value) -> Result<WebhookReceipt, WebhookError> {
        let body = serde_json::to_vec(&event).unwrap();
        let header = signature_header(SECRET, &body, Utc::now().timestamp());
        harness.reconciler.handle(&body, Some(&header)).await
    }

    fn checkout(event_id: &str, session_id: &str, mode: &str, account: Uuid) -> Value {
        json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": session_id,
                "mode": mode,
                "metadata": { "userId": account.to_string() },
                "customer": "cus_1",
                "subscription": if mode == "subscription" { json!("sub_1") } else { Value::Null }
            }}
        })
    }

    fn lifecycle(event_id: &str, kind: &str, status: &str) -> Value {
        json!({
            "id": event_id,
            "type": kind,
            "data": { "object": {
                "id": "sub_1",
                "status": status,
                "cancel_at_period_end": true,
                "items": { "data": [] }
            }}
        })
    }

    #[tokio::test]
    async fn credit_purchase_applies_once() {
        let h = harness("free");

        let first = deliver(&h, checkout("evt_1", "cs_small", "payment", h.account_id))
            .await
            .unwrap();
        assert_eq!(
            first,
            WebhookReceipt::Reconciled(ReconcileOutcome::Applied(EffectApplied::Credited {
                balance: 100
            }))
        );

        let replay = deliver(&h, checkout("evt_1", "cs_small", "payment", h.account_id))
            .await
            .unwrap();
        assert_eq!(replay, WebhookReceipt::Reconciled(ReconcileOutcome::Duplicate));

        // a second event id carrying the same checkout session is also caught
        let redelivered = deliver(&h, checkout("evt_1b", "cs_small", "payment", h.account_id))
            .await
            .unwrap();
        assert_eq!(
            redelivered,
            WebhookReceipt::Reconciled(ReconcileOutcome::Duplicate)
        );

        assert_eq!(h.store.balance(h.account_id).await.unwrap(), 100);
        assert_eq!(h.store.ledger_snapshot(h.account_id).len(), 1);
    }

    #[tokio::test]
    async fn unknown_price_is_ignored() {
        let h = harness("free");

        let odd = deliver(&h, checkout("evt_2", "cs_odd", "payment", h.account_id))
            .await
            .unwrap();
        assert_eq!(odd, WebhookReceipt::Ignored(IgnoreReason::UnknownPrice));

        assert_eq!(h.store.balance(h.account_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn paid_checkout_for_missing_account_waits_for_redelivery() {
        let h = harness("free");
        let late_account = Uuid::new_v4();
        let event = checkout("evt_3", "cs_small", "payment", late_account);

        let err = deliver(&h, event.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            WebhookError::Billing(BillingError::AccountNotFound(id)) if id == late_account
        ));

        h.store
            .insert_account(late_account, "late@example.com", "free", 0);
        let redelivered = deliver(&h, event.clone()).await.unwrap();
        assert_eq!(
            redelivered,
            WebhookReceipt::Reconciled(ReconcileOutcome::Applied(EffectApplied::Credited {
                balance: 100
            }))
        );
        let again = deliver(&h, event).await.unwrap();
        assert_eq!(again, WebhookReceipt::Reconciled(ReconcileOutcome::Duplicate));
        assert_eq!(h.store.balance(late_account).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn subscription_checkout_for_missing_account_is_retryable() {
        let h = harness("free");
        let err = deliver(&h, checkout("evt_4", "cs_sub", "subscription", Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WebhookError::Billing(BillingError::AccountNotFound(_))
        ));
        assert!(h.store.subscription("sub_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subscription_lifecycle_follows_gateway() {
        let h = harness("free");

        deliver(&h, checkout("evt_10", "cs_sub", "subscription", h.account_id))
            .await
            .unwrap();
        let account = h.store.account(h.account_id).await.unwrap().unwrap();
        assert_eq!(account.plan, "unlimited");
        let subscription = h.store.subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.external_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(
            subscription.current_period_end.map(|end| end.timestamp()),
            Some(1_762_592_000)
        );

        deliver(&h, lifecycle("evt_11", "customer.subscription.updated", "unpaid"))
            .await
            .unwrap();
        let subscription = h.store.subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::PastDue);
        assert!(subscription.cancel_at_period_end);
        // no period in the update keeps the stored one
        assert_eq!(
            subscription.current_period_end.map(|end| end.timestamp()),
            Some(1_762_592_000)
        );

        deliver(&h, lifecycle("evt_12", "customer.subscription.deleted", "canceled"))
            .await
            .unwrap();
        let subscription = h.store.subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Canceled);
        let account = h.store.account(h.account_id).await.unwrap().unwrap();
        assert_eq!(account.plan, "free");

        let late = deliver(&h, lifecycle("evt_13", "customer.subscription.updated", "active"))
            .await
            .unwrap();
        assert!(matches!(
            late,
            WebhookReceipt::Reconciled(ReconcileOutcome::Rejected(_))
        ));
        let account = h.store.account(h.account_id).await.unwrap().unwrap();
        assert_eq!(account.plan, "free");
    }

    #[tokio::test]
    async fn events_for_unknown_subscriptions_are_no_ops() {
        let h = harness("free");
        let receipt = deliver(&h, lifecycle("evt_20", "customer.subscription.deleted", "canceled"))
            .await
            .unwrap();
        assert_eq!(
            receipt,
            WebhookReceipt::Reconciled(ReconcileOutcome::UnknownReference)
        );
        assert!(h.store.subscription("sub_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unhandled_types_are_ignored() {
        let h = harness("free");
        let receipt = deliver(
            &h,
            json!({ "id": "evt_30", "type": "invoice.paid", "data": { "object": {} } }),
        )
        .await
        .unwrap();
        assert_eq!(
            receipt,
            WebhookReceipt::Ignored(IgnoreReason::UnhandledEventType)
        );
    }

    #[tokio::test]
    async fn bad_signature_changes_nothing() {
        let h = harness("free");
        let body = serde_json::to_vec(&checkout("evt_40", "cs_small", "payment", h.account_id))
            .unwrap();
        let header = signature_header("whsec_forged", &body, Utc::now().timestamp());

        let err = h.reconciler.handle(&body, Some(&header)).await.unwrap_err();
        assert!(matches!(
            err,
            WebhookError::Signature(SignatureError::Mismatch)
        ));
        assert_eq!(h.store.balance(h.account_id).await.unwrap(), 0);
        assert!(h.store.ledger_snapshot(h.account_id).is_empty());
    }
}
