//! Persistence: the primary JSON run store and the optional Postgres
//! analytics mirror.

mod analytics;
mod run_store;
mod schema;

pub use analytics::{AnalyticsError, AnalyticsMirror, AnalyticsStore};
pub use run_store::{RunStore, StoreError};
