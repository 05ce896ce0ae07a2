//! Core types and shared utilities for the chainrelay pipeline.
//!
//! This crate provides:
//! - The canonical record model (envelope kinds, relay topics, content ids)
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod record;
pub mod metrics;

pub use error::{Error, Result};
pub use record::{content_id, Envelope, MsgType, Record, RecordKind};
