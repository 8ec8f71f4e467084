use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::error::BillingError;
use super::models::{
    Account, LedgerEntry, Subscription, SubscriptionStatus, TransactionKind, TransactionStatus,
};
use super::plans::Plan;
use super::store::{
    BillingStore, CreditOutcome, CreditPurchase, EffectApplied, LedgerFilter, NewSubscription,
    ProcessedEvent, ReconcileEffect, ReconcileOutcome, SubscriptionChange,
};

#[derive(Clone, Default)]
struct State {
    accounts: HashMap<Uuid, Account>,
    ledger: Vec<LedgerEntry>,
    subscriptions: HashMap<String, Subscription>,
    processed_events: HashSet<String>,
}

/// key: billing-store-memory -> single-lock store for tests and local runs
///
/// Each operation works on a copy of the state and swaps it in only on
/// success, which gives the same all-or-nothing behaviour as a transaction.
#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<State>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stands in for the identity service creating the account at first sign-in.
    pub fn insert_account(&self, account_id: Uuid, email: &str, plan: &str, credit_balance: i64) {
        let now = Utc::now();
        let mut state = self.lock();
        state.accounts.insert(
            account_id,
            Account {
                id: account_id,
                email: email.to_string(),
                plan: plan.to_string(),
                credit_balance,
                daily_usage_count: 0,
                created_at: now,
                updated_at: now,
            },
        );
    }

    pub fn ledger_snapshot(&self, account_id: Uuid) -> Vec<LedgerEntry> {
        self.lock()
            .ledger
            .iter()
            .filter(|entry| entry.account_id == account_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a panic while holding the lock leaves no partial write behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transact<T>(
        &self,
        apply: impl FnOnce(&mut State) -> Result<(T, bool), BillingError>,
    ) -> Result<T, BillingError> {
        let mut guard = self.lock();
        let mut draft = guard.clone();
        let (value, commit) = apply(&mut draft)?;
        if commit {
            *guard = draft;
        }
        Ok(value)
    }
}

impl State {
    fn account_mut(&mut self, account_id: Uuid) -> Result<&mut Account, BillingError> {
        self.accounts
            .get_mut(&account_id)
            .ok_or(BillingError::AccountNotFound(account_id))
    }

    fn append(
        &mut self,
        account_id: Uuid,
        kind: TransactionKind,
        credits_delta: i64,
        amount_minor_units: Option<i64>,
        gateway_reference_id: Option<String>,
    ) {
        self.ledger.push(LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            kind,
            credits_delta,
            amount_minor_units,
            gateway_reference_id,
            status: TransactionStatus::Completed,
            created_at: Utc::now(),
        });
    }

    fn purchase(&mut self, purchase: &CreditPurchase) -> Result<CreditOutcome, BillingError> {
        let seen = self.ledger.iter().any(|entry| {
            entry.gateway_reference_id.as_deref() == Some(purchase.gateway_reference_id.as_str())
        });
        if seen {
            return Ok(CreditOutcome::Duplicate);
        }

        let account = self.account_mut(purchase.account_id)?;
        account.credit_balance += purchase.credits;
        if account.plan != Plan::Unlimited.as_str() {
            account.plan = Plan::Credits.as_str().to_string();
        }
        account.updated_at = Utc::now();
        let balance = account.credit_balance;

        self.append(
            purchase.account_id,
            TransactionKind::Purchase,
            purchase.credits,
            Some(purchase.amount_minor_units),
            Some(purchase.gateway_reference_id.clone()),
        );
        Ok(CreditOutcome::Credited { balance })
    }

    fn activate(&mut self, subscription: &NewSubscription) -> Result<ReconcileOutcome, BillingError> {
        self.account_mut(subscription.account_id)?;
        if self
            .subscriptions
            .contains_key(&subscription.external_subscription_id)
        {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let now = Utc::now();
        self.subscriptions.insert(
            subscription.external_subscription_id.clone(),
            Subscription {
                id: Uuid::new_v4(),
                account_id: subscription.account_id,
                external_subscription_id: subscription.external_subscription_id.clone(),
                external_customer_id: subscription.external_customer_id.clone(),
                status: SubscriptionStatus::Active,
                current_period_start: subscription.period.map(|period| period.start),
                current_period_end: subscription.period.map(|period| period.end),
                cancel_at_period_end: false,
                created_at: now,
                updated_at: now,
            },
        );
        let account = self.account_mut(subscription.account_id)?;
        account.plan = Plan::Unlimited.as_str().to_string();
        account.updated_at = now;

        Ok(ReconcileOutcome::Applied(
            EffectApplied::SubscriptionActivated {
                account_id: subscription.account_id,
            },
        ))
    }

    fn transition(
        &mut self,
        external_subscription_id: &str,
        change: &SubscriptionChange,
    ) -> Result<ReconcileOutcome, BillingError> {
        let Some(current) = self.subscriptions.get_mut(external_subscription_id) else {
            return Ok(ReconcileOutcome::UnknownReference);
        };

        let from = current.status;
        let next = match from.apply(change.event) {
            Ok(next) => next,
            Err(invalid) => return Ok(ReconcileOutcome::Rejected(invalid)),
        };

        current.status = next;
        if let Some(period) = change.period {
            current.current_period_start = Some(period.start);
            current.current_period_end = Some(period.end);
        }
        if let Some(flag) = change.cancel_at_period_end {
            current.cancel_at_period_end = flag;
        }
        current.updated_at = Utc::now();
        let account_id = current.account_id;

        let other_live = self.subscriptions.values().any(|subscription| {
            subscription.account_id == account_id
                && subscription.external_subscription_id != external_subscription_id
                && !subscription.status.is_terminal()
        });
        if next.is_terminal() && !from.is_terminal() && !other_live {
            if let Some(account) = self.accounts.get_mut(&account_id) {
                account.plan = Plan::Free.as_str().to_string();
                account.updated_at = Utc::now();
            }
        }

        Ok(ReconcileOutcome::Applied(EffectApplied::SubscriptionMoved {
            account_id,
            from,
            to: next,
        }))
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn account(&self, account_id: Uuid) -> Result<Option<Account>, BillingError> {
        Ok(self.lock().accounts.get(&account_id).cloned())
    }

    async fn balance(&self, account_id: Uuid) -> Result<i64, BillingError> {
        Ok(self
            .lock()
            .accounts
            .get(&account_id)
            .map(|account| account.credit_balance)
            .unwrap_or(0))
    }

    async fn add_credits(&self, purchase: &CreditPurchase) -> Result<CreditOutcome, BillingError> {
        self.transact(|state| {
            let outcome = state.purchase(purchase)?;
            let commit = matches!(outcome, CreditOutcome::Credited { .. });
            Ok((outcome, commit))
        })
    }

    async fn debit_credits(&self, account_id: Uuid, credits: i64) -> Result<i64, BillingError> {
        self.transact(|state| {
            let account = state.account_mut(account_id)?;
            let previous = account.credit_balance;
            account.credit_balance = (previous - credits).max(0);
            account.updated_at = Utc::now();
            let balance = account.credit_balance;
            let removed = previous - balance;
            if removed > 0 {
                state.append(account_id, TransactionKind::Usage, -removed, None, None);
            }
            Ok((balance, true))
        })
    }

    async fn reserve_credits(
        &self,
        account_id: Uuid,
        credits: i64,
    ) -> Result<Option<i64>, BillingError> {
        self.transact(|state| {
            let Some(account) = state.accounts.get_mut(&account_id) else {
                return Ok((None, false));
            };
            if account.credit_balance < credits {
                return Ok((None, false));
            }
            account.credit_balance -= credits;
            account.updated_at = Utc::now();
            let balance = account.credit_balance;
            state.append(account_id, TransactionKind::Usage, -credits, None, None);
            Ok((Some(balance), true))
        })
    }

    async fn refund_credits(&self, account_id: Uuid, credits: i64) -> Result<i64, BillingError> {
        self.transact(|state| {
            let account = state.account_mut(account_id)?;
            account.credit_balance += credits;
            account.updated_at = Utc::now();
            let balance = account.credit_balance;
            state.append(account_id, TransactionKind::Refund, credits, None, None);
            Ok((balance, true))
        })
    }

    async fn ledger_entries(
        &self,
        account_id: Uuid,
        filter: &LedgerFilter,
    ) -> Result<Vec<LedgerEntry>, BillingError> {
        let limit = usize::try_from(filter.effective_limit()).unwrap_or(usize::MAX);
        Ok(self
            .lock()
            .ledger
            .iter()
            .rev()
            .filter(|entry| entry.account_id == account_id)
            .filter(|entry| filter.kind.map_or(true, |kind| entry.kind == kind))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn subscription(
        &self,
        external_subscription_id: &str,
    ) -> Result<Option<Subscription>, BillingError> {
        Ok(self
            .lock()
            .subscriptions
            .get(external_subscription_id)
            .cloned())
    }

    async fn reconcile(
        &self,
        event: &ProcessedEvent,
        effect: &ReconcileEffect,
    ) -> Result<ReconcileOutcome, BillingError> {
        self.transact(|state| {
            if !state.processed_events.insert(event.event_id.clone()) {
                return Ok((ReconcileOutcome::Duplicate, false));
            }

            let outcome = match effect {
                ReconcileEffect::Purchase(purchase) => match state.purchase(purchase)? {
                    CreditOutcome::Credited { balance } => {
                        ReconcileOutcome::Applied(EffectApplied::Credited { balance })
                    }
                    CreditOutcome::Duplicate => ReconcileOutcome::Duplicate,
                },
                ReconcileEffect::Activate(subscription) => state.activate(subscription)?,
                ReconcileEffect::Transition {
                    external_subscription_id,
                    change,
                } => state.transition(external_subscription_id, change)?,
            };

            let commit = matches!(
                outcome,
                ReconcileOutcome::Applied(_) | ReconcileOutcome::Rejected(_)
            );
            Ok((outcome, commit))
        })
    }
}
