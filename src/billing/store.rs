use async_trait::async_trait;
use uuid::Uuid;

use super::error::BillingError;
use super::models::{
    Account, BillingPeriod, LedgerEntry, Subscription, SubscriptionStatus, TransactionKind,
};
use super::subscription::{InvalidTransition, LifecycleEvent};

/// A completed one-time payment to be turned into credits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditPurchase {
    pub account_id: Uuid,
    pub credits: i64,
    pub gateway_reference_id: String,
    pub amount_minor_units: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub account_id: Uuid,
    pub external_subscription_id: String,
    pub external_customer_id: Option<String>,
    pub period: Option<BillingPeriod>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub event: LifecycleEvent,
    pub period: Option<BillingPeriod>,
    pub cancel_at_period_end: Option<bool>,
}

/// Gateway event identity recorded in the dedup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEffect {
    Purchase(CreditPurchase),
    Activate(NewSubscription),
    Transition {
        external_subscription_id: String,
        change: SubscriptionChange,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectApplied {
    Credited { balance: i64 },
    SubscriptionActivated { account_id: Uuid },
    SubscriptionMoved {
        account_id: Uuid,
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(EffectApplied),
    /// Event id or gateway reference already processed; nothing changed.
    Duplicate,
    /// Subscription id not on file. The event is not marked processed so a
    /// later replay can still apply it.
    UnknownReference,
    /// Transition refused by the state machine; the event is marked processed.
    Rejected(InvalidTransition),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited { balance: i64 },
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub kind: Option<TransactionKind>,
    pub limit: Option<i64>,
}

impl LedgerFilter {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 200;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

/// key: billing-store -> transactional seam between policy and storage
///
/// Every method is all-or-nothing: the balance mutation, the ledger entry, and
/// (for `reconcile`) the dedup mark commit together or not at all.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn account(&self, account_id: Uuid) -> Result<Option<Account>, BillingError>;

    /// Balance of a missing account reads as zero.
    async fn balance(&self, account_id: Uuid) -> Result<i64, BillingError>;

    /// Increments the balance, lifts a free account to the credits plan and
    /// appends a completed purchase entry. Idempotent on the gateway reference.
    async fn add_credits(&self, purchase: &CreditPurchase) -> Result<CreditOutcome, BillingError>;

    /// Decrements with a floor at zero and returns the resulting balance.
    async fn debit_credits(&self, account_id: Uuid, credits: i64) -> Result<i64, BillingError>;

    /// Debits only when the full amount is available. `None` means the balance
    /// was insufficient and nothing changed.
    async fn reserve_credits(
        &self,
        account_id: Uuid,
        credits: i64,
    ) -> Result<Option<i64>, BillingError>;

    async fn refund_credits(&self, account_id: Uuid, credits: i64) -> Result<i64, BillingError>;

    async fn ledger_entries(
        &self,
        account_id: Uuid,
        filter: &LedgerFilter,
    ) -> Result<Vec<LedgerEntry>, BillingError>;

    async fn subscription(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>, BillingError>;

    /// Applies a webhook effect exactly once per gateway event id.
    async fn reconcile(
        &self,
        event: &ProcessedEvent,
        effect: &ReconcileEffect,
    ) -> Result<ReconcileOutcome, BillingError>;
}
