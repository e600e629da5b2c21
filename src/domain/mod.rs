//! Domain types: pricing, payment state machine, gateway wire types and ports.

pub mod gateway;
pub mod payment;
pub mod ports;
pub mod pricing;
pub mod request;
