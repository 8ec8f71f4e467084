pub mod billing;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod provider;
pub mod routes;
pub mod webhooks;

pub use config::plan_catalog_from_env;
pub use routes::{api_routes, app, AppServices};
