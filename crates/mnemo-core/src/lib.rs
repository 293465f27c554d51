//! # mnemo-core
//!
//! Foundation types and utilities shared by the Mnemo crates.
//!
//! - **Branded IDs**: `EntityId`, `MessageId`, `SessionId` as newtypes for type safety
//! - **Retry**: `RetryConfig`, exponential backoff with symmetric jitter
//! - **Logging**: `tracing` subscriber setup and log-capture helpers for tests

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod retry;
