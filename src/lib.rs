//! Floodgate - Abuse-Resistant Request Throttling
//!
//! This crate implements per-caller, per-operation token bucket rate
//! limiting for public endpoints. Bucket state lives in a shared store so
//! every replica enforces the same limits, denials are logged as abuse
//! metrics, and sustained abuse escalates to a human-verification challenge.

pub mod abuse;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod janitor;
pub mod ratelimit;
pub mod service;
pub mod store;

pub use error::{FloodgateError, Result, StoreError};
pub use service::{Floodgate, GateDecision};
