//! Breakwater - Circuit Breaking and Rate Limiting
//!
//! This crate provides two guards for calls to unreliable or shared
//! dependencies: a three-state circuit breaker that fails fast while a
//! dependency keeps failing, and a family of keyed rate limiters. The
//! limiters run either in process (token bucket, sliding window) or against
//! a shared store so that many processes draw from one quota.

pub mod circuitbreaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
