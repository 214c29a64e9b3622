//! Rate limiting HTTP gateway.
//!
//! Fronts a configured upstream API and meters requests through the
//! `ratelimit` engine: quota headers on every metered response, 429 on
//! exhaustion, a local fallback limiter while the shared counter store is
//! down, and background refresh of the reference tables.

pub mod configuration;
pub mod proxy;
pub mod server;
