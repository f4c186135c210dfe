//! Self-hostable HTTP webhook queue.
//!
//! Clients POST a callback URL and payload; the service persists the message,
//! waits until its publish instant, then delivers it with bounded retries and
//! a dead-letter fallback. Delivery is at-least-once: targets must be
//! idempotent.

pub mod activator;
pub mod api;
pub mod auth;
pub mod config;
pub mod deliver;
pub mod error;
pub mod logs;
pub mod model;
pub mod queue;
pub mod service;
pub mod state;
pub mod stats;
pub mod store;
