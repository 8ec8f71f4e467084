use std::fmt;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::error::BillingError;
use super::ledger::CreditLedger;
use super::plans::{Plan, CREDIT_COST_PER_MESSAGE};
use super::rate_limit::RateLimiter;

/// Why a request was turned away. Messages are shown to end users verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    DailyLimitReached,
    InsufficientCredits,
    UnknownPlan,
}

impl DenialReason {
    pub fn message(&self) -> &'static str {
        match self {
            DenialReason::DailyLimitReached => {
                "Limite diario atingido. Faca upgrade para continuar usando."
            }
            DenialReason::InsufficientCredits => {
                "Creditos insuficientes. Compre mais creditos para continuar."
            }
            DenialReason::UnknownPlan => "Plano invalido.",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageDecision {
    Allowed { remaining: Option<i64> },
    Denied(DenialReason),
}

impl UsageDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, UsageDecision::Allowed { .. })
    }
}

/// Proof that a request was admitted. Hand it back to
/// [`UsagePolicyEngine::release`] when the request fails so a reserved credit
/// is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct UsageTicket {
    pub account_id: Uuid,
    pub plan: Plan,
    pub remaining: Option<i64>,
    reserved_credits: i64,
}

impl UsageTicket {
    pub fn reserved_credits(&self) -> i64 {
        self.reserved_credits
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted(UsageTicket),
    Denied(DenialReason),
}

/// key: usage-policy -> admit/deny per plan
///
/// Two request paths are offered. `check_usage` followed by `record_usage`
/// reads the balance and debits it later with nothing held in between, so two
/// concurrent requests on the last credit can both be admitted (the debit
/// floor keeps the balance at zero). `admit` closes that window by reserving
/// the credit in the same store transaction as the check; `release` returns it
/// if the request fails.
#[derive(Clone)]
pub struct UsagePolicyEngine {
    limiter: RateLimiter,
    ledger: CreditLedger,
    cost_per_message: i64,
}

impl UsagePolicyEngine {
    pub fn new(limiter: RateLimiter, ledger: CreditLedger) -> Self {
        Self {
            limiter,
            ledger,
            cost_per_message: CREDIT_COST_PER_MESSAGE,
        }
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub async fn check_usage(
        &self,
        account_id: Uuid,
        plan: Plan,
    ) -> Result<UsageDecision, BillingError> {
        let decision = match plan {
            Plan::Free => self.consume_free_quota(account_id).await?,
            Plan::Credits => {
                let balance = self.ledger.get_balance(account_id).await?;
                if balance < self.cost_per_message {
                    UsageDecision::Denied(DenialReason::InsufficientCredits)
                } else {
                    UsageDecision::Allowed {
                        remaining: Some(balance),
                    }
                }
            }
            Plan::Unlimited => UsageDecision::Allowed { remaining: None },
        };

        if let UsageDecision::Denied(reason) = decision {
            debug!(%account_id, plan = %plan, ?reason, "usage denied");
        }
        Ok(decision)
    }

    /// Call only after the request completed. Debits the message cost on the
    /// credits plan; free and unlimited are no-ops.
    pub async fn record_usage(&self, account_id: Uuid, plan: Plan) -> Result<(), BillingError> {
        match plan {
            Plan::Credits => {
                self.ledger
                    .debit_credits(account_id, self.cost_per_message)
                    .await?;
            }
            Plan::Free | Plan::Unlimited => {}
        }
        Ok(())
    }

    /// Like [`check_usage`](Self::check_usage) but accepts the stored plan
    /// label; labels that are not a known plan are denied.
    pub async fn admit_account(
        &self,
        account_id: Uuid,
        plan_label: &str,
    ) -> Result<Admission, BillingError> {
        match plan_label.parse::<Plan>() {
            Ok(plan) => self.admit(account_id, plan).await,
            Err(()) => {
                debug!(%account_id, plan = plan_label, "usage denied for unrecognised plan");
                Ok(Admission::Denied(DenialReason::UnknownPlan))
            }
        }
    }

    pub async fn admit(&self, account_id: Uuid, plan: Plan) -> Result<Admission, BillingError> {
        let ticket = |remaining, reserved_credits| UsageTicket {
            account_id,
            plan,
            remaining,
            reserved_credits,
        };

        let admission = match plan {
            Plan::Free => match self.consume_free_quota(account_id).await? {
                UsageDecision::Allowed { remaining } => Admission::Granted(ticket(remaining, 0)),
                UsageDecision::Denied(reason) => Admission::Denied(reason),
            },
            Plan::Credits => match self.ledger.reserve(account_id, self.cost_per_message).await? {
                Some(balance) => Admission::Granted(ticket(Some(balance), self.cost_per_message)),
                None => Admission::Denied(DenialReason::InsufficientCredits),
            },
            Plan::Unlimited => Admission::Granted(ticket(None, 0)),
        };

        if let Admission::Denied(reason) = &admission {
            debug!(%account_id, plan = %plan, ?reason, "usage denied");
        }
        Ok(admission)
    }

    /// Returns whatever the ticket reserved. The free-tier counter is not
    /// decremented: a failed free request still counts toward the quota.
    pub async fn release(&self, ticket: UsageTicket) -> Result<(), BillingError> {
        if ticket.reserved_credits > 0 {
            self.ledger
                .refund(ticket.account_id, ticket.reserved_credits)
                .await?;
            debug!(account_id = %ticket.account_id, credits = ticket.reserved_credits, "reserved credits released");
        }
        Ok(())
    }

    async fn consume_free_quota(&self, account_id: Uuid) -> Result<UsageDecision, BillingError> {
        let decision = self.limiter.consume(account_id).await;
        if decision.store_unavailable {
            return Err(BillingError::CountersUnavailable);
        }
        if !decision.allowed {
            return Ok(UsageDecision::Denied(DenialReason::DailyLimitReached));
        }
        Ok(UsageDecision::Allowed {
            remaining: Some(i64::try_from(decision.remaining).unwrap_or(i64::MAX)),
        })
    }
}
