pub mod adapters;
pub mod api;
pub mod error;
pub mod events;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod plans;
pub mod postgres;
pub mod rate_limit;
pub mod reconciliation;
pub mod signature;
pub mod store;
pub mod subscription;
pub mod usage;

pub use adapters::{
    CheckoutRequest, CheckoutSessionCreated, GatewayError, PaymentGateway, StripeAdapter,
};
pub use api::{
    current_plan as billing_current_plan, list_plan_catalog as billing_list_plan_catalog,
    list_transactions as billing_list_transactions, purchase as billing_purchase,
    PurchaseRequest, PurchaseResponse, TransactionQuery,
};
pub use error::BillingError;
pub use events::{parse_event, GatewayEvent, GatewaySubscription, ParsedEvent};
pub use ledger::CreditLedger;
pub use memory::MemoryBillingStore;
pub use models::{
    Account, BillingPeriod, LedgerEntry, PlanSummary, Subscription, SubscriptionStatus,
    TransactionKind, TransactionStatus,
};
pub use plans::{CheckoutMode, CreditPackage, Plan, PlanCatalog, PriceIds, CREDIT_COST_PER_MESSAGE};
pub use postgres::PgBillingStore;
pub use rate_limit::{
    CounterStore, CounterStoreError, MemoryCounterStore, RateDecision, RateLimiter,
    RedisCounterStore,
};
pub use reconciliation::{IgnoreReason, WebhookError, WebhookReceipt, WebhookReconciler};
pub use signature::{signature_header, SignatureError, SignatureVerifier, SIGNATURE_HEADER};
pub use store::{
    BillingStore, CreditOutcome, CreditPurchase, EffectApplied, LedgerFilter, ReconcileOutcome,
};
pub use subscription::{LifecycleEvent, SubscriptionStateMachine};
pub use usage::{Admission, DenialReason, UsageDecision, UsagePolicyEngine, UsageTicket};
