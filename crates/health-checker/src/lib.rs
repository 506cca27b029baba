//! Cascading health probes for azd-app services
//!
//! Given a registry entry and its optional declared health check, the
//! checker picks the strongest applicable probe: explicit HTTP endpoint,
//! discovered HTTP endpoint, TCP connect, then bare process liveness.
//! Rounds sweep all services with a bounded fan-out; the only state kept
//! across rounds is the per-service discovered-endpoint cache.

#![warn(missing_docs)]

pub mod checker;
pub mod http;
pub mod report;

pub use checker::{CheckerConfig, HealthChecker};
pub use report::{CheckType, HealthCheckResult, HealthReport, HealthSummary};
