//! Tollgate - Rate Limiting and Abuse Prevention
//!
//! This crate implements per-identifier, per-endpoint-category rate limiting
//! with escalating temporary blocks. Window state is persisted in a durable
//! store, expired state is evicted by a background job, and HTTP guard
//! middleware turns verdicts into responses.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
