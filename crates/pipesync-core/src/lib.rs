//! # pipesync core
//!
//! Runtime-free logic shared by the pipesync service: the local CRM data
//! model, the error taxonomy, the [`store::Store`] abstraction with an
//! in-memory implementation, outbound payload sanitization, custom-field
//! discovery and option translation, normalization of loosely-typed remote
//! payloads, and sync progress arithmetic.
//!
//! This crate contains no tokio, sqlx, or HTTP client dependencies. Every
//! piece of I/O lives in the `pipesync` crate and reaches this one through
//! plain values or the `Store` trait.

pub mod error;
pub mod fields;
pub mod models;
pub mod progress;
pub mod remote;
pub mod sanitize;
pub mod store;
