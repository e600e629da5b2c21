//! Application layer orchestrating payments on top of the domain ports.
//!
//! `PaymentStateStore` holds the authoritative per-order state, the
//! `UnifiedPaymentService` drives each payment rail against the gateway, and
//! the `ReconciliationMonitor` polls orders that are still waiting on an
//! asynchronous approval.

pub mod monitor;
pub mod pricing;
pub mod service;
pub mod store;
