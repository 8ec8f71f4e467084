use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::error::BillingError;
use super::models::{BillingPeriod, SubscriptionStatus};
use super::store::{
    BillingStore, NewSubscription, ProcessedEvent, ReconcileEffect, ReconcileOutcome,
    SubscriptionChange,
};

/// Gateway lifecycle notification, reduced to what the state machine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Gateway reported the subscription as `active`.
    Renewed,
    /// Gateway reported any status other than `active`.
    PaymentLapsed,
    Deleted,
}

impl LifecycleEvent {
    pub fn from_gateway_status(status: &str) -> Self {
        if status == "active" {
            LifecycleEvent::Renewed
        } else {
            LifecycleEvent::PaymentLapsed
        }
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("subscription cannot move from {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: SubscriptionStatus,
    pub event: LifecycleEvent,
}

impl SubscriptionStatus {
    /// `incomplete -> active <-> past_due`, `active|past_due -> canceled`.
    /// Canceled is terminal; a repeated deletion is accepted as a no-op.
    pub fn apply(self, event: LifecycleEvent) -> Result<SubscriptionStatus, InvalidTransition> {
        use LifecycleEvent::*;
        use SubscriptionStatus::*;

        match (self, event) {
            (Canceled, Deleted) => Ok(Canceled),
            (Active | PastDue, Deleted) => Ok(Canceled),
            (Incomplete | Active | PastDue, Renewed) => Ok(Active),
            (Active | PastDue, PaymentLapsed) => Ok(PastDue),
            (Incomplete, PaymentLapsed | Deleted) | (Canceled, Renewed | PaymentLapsed) => {
                Err(InvalidTransition { from: self, event })
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }
}

/// key: billing-subscription-lifecycle -> gateway-driven transitions
#[derive(Clone)]
pub struct SubscriptionStateMachine {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionStateMachine {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Records a newly paid subscription as `active` and moves the account to unlimited.
    pub async fn activate(
        &self,
        event: &ProcessedEvent,
        subscription: NewSubscription,
    ) -> Result<ReconcileOutcome, BillingError> {
        let external_id = subscription.external_subscription_id.clone();
        let outcome = self
            .store
            .reconcile(event, &ReconcileEffect::Activate(subscription))
            .await?;
        info!(
            event_id = %event.event_id,
            subscription = %external_id,
            ?outcome,
            "subscription activation reconciled"
        );
        Ok(outcome)
    }

    /// Applies an `updated` notification: status follows the gateway, period
    /// and cancel-at-period-end are always refreshed.
    pub async fn update(
        &self,
        event: &ProcessedEvent,
        external_subscription_id: &str,
        gateway_status: &str,
        period: Option<BillingPeriod>,
        cancel_at_period_end: bool,
    ) -> Result<ReconcileOutcome, BillingError> {
        let change = SubscriptionChange {
            event: LifecycleEvent::from_gateway_status(gateway_status),
            period,
            cancel_at_period_end: Some(cancel_at_period_end),
        };
        self.transition(event, external_subscription_id, change).await
    }

    /// Cancels the subscription and downgrades the account to free immediately.
    pub async fn cancel(
        &self,
        event: &ProcessedEvent,
        external_subscription_id: &str,
    ) -> Result<ReconcileOutcome, BillingError> {
        let change = SubscriptionChange {
            event: LifecycleEvent::Deleted,
            period: None,
            cancel_at_period_end: None,
        };
        self.transition(event, external_subscription_id, change).await
    }

    async fn transition(
        &self,
        event: &ProcessedEvent,
        external_subscription_id: &str,
        change: SubscriptionChange,
    ) -> Result<ReconcileOutcome, BillingError> {
        let lifecycle = change.event;
        let outcome = self
            .store
            .reconcile(
                event,
                &ReconcileEffect::Transition {
                    external_subscription_id: external_subscription_id.to_string(),
                    change,
                },
            )
            .await?;

        match &outcome {
            ReconcileOutcome::UnknownReference => debug!(
                event_id = %event.event_id,
                subscription = external_subscription_id,
                "lifecycle event for subscription not on file"
            ),
            _ => info!(
                event_id = %event.event_id,
                subscription = external_subscription_id,
                event = ?lifecycle,
                ?outcome,
                "subscription lifecycle reconciled"
            ),
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent::*;
    use SubscriptionStatus::*;

    #[test]
    fn incomplete_subscription_activates_on_renewal() {
        assert_eq!(Incomplete.apply(Renewed), Ok(Active));
    }

    #[test]
    fn active_and_past_due_alternate() {
        assert_eq!(Active.apply(PaymentLapsed), Ok(PastDue));
        assert_eq!(PastDue.apply(Renewed), Ok(Active));
        assert_eq!(Active.apply(Renewed), Ok(Active));
    }

    #[test]
    fn any_non_active_gateway_status_lapses() {
        for status in ["past_due", "unpaid", "incomplete", "trialing"] {
            assert_eq!(LifecycleEvent::from_gateway_status(status), PaymentLapsed);
        }
        assert_eq!(LifecycleEvent::from_gateway_status("active"), Renewed);
    }

    #[test]
    fn deletion_cancels_from_live_states() {
        assert_eq!(Active.apply(Deleted), Ok(Canceled));
        assert_eq!(PastDue.apply(Deleted), Ok(Canceled));
        assert_eq!(Canceled.apply(Deleted), Ok(Canceled));
    }

    #[test]
    fn incomplete_only_moves_to_active() {
        for event in [PaymentLapsed, Deleted] {
            let err = Incomplete.apply(event).unwrap_err();
            assert_eq!(err.from, Incomplete);
            assert_eq!(err.event, event);
        }
        assert_eq!(Incomplete.apply(Renewed), Ok(Active));
    }

    #[test]
    fn canceled_never_reactivates() {
        let err = Canceled.apply(Renewed).unwrap_err();
        assert_eq!(err.from, Canceled);
        assert_eq!(err.event, Renewed);
        assert!(Canceled.apply(PaymentLapsed).is_err());
        assert!(Canceled.is_terminal());
    }
}
