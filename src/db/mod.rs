pub mod accounts;
pub mod credit_transactions;
pub mod subscriptions;
pub mod webhook_events;
