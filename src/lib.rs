//! Warden - Adaptive Rate Limiting and Abuse Mitigation
//!
//! This crate decides whether an identifier (IP, username, API key) may
//! perform an action, escalates repeated violations to temporary blocks, and
//! fails over from a shared Redis backend to in-process state when Redis
//! becomes unreliable.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
