//! # pipesync
//!
//! Bidirectional synchronization between a local CRM store and Pipedrive.
//!
//! The local store is the system of record. Pipedrive is a remote mirror
//! that contacts are promoted into, activities are replicated into, and
//! persons are bulk-imported from.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────┐   ┌────────────┐
//! │  HTTP / CLI  │──▶│ Promote · Replicate  │──▶│ Pipedrive  │
//! │ server, main │   │ Lifecycle · BulkSync │   │  REST API  │
//! └──────────────┘   └──────────┬───────────┘   └────────────┘
//!                               │ Reconciler
//!                               ▼
//!                         ┌───────────┐
//!                         │  SQLite   │
//!                         │  (Store)  │
//!                         └───────────┘
//! ```
//!
//! Pure types, sanitization, and field matching live in
//! [`pipesync_core`]; everything with I/O lives here.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | [`Store`](pipesync_core::store::Store) over SQLite |
//! | [`retry`] | Backoff with jitter |
//! | [`client`] | Pipedrive REST client |
//! | [`discovery`] | Live custom-field discovery |
//! | [`reconcile`] | Deduplication, org resolution, entity locks |
//! | [`promote`] | Warm-lead promotion |
//! | [`replicate`] | Activity replication |
//! | [`lifecycle`] | Contact deactivation and reactivation |
//! | [`bulk_sync`] | Paged import of remote persons |
//! | [`progress`] | Progress reporters |
//! | [`hub`] | Registry of in-flight syncs |
//! | [`services`] | Contact, campaign, activity, and user CRUD |
//! | [`app`] | Wiring |
//! | [`server`] | HTTP server |

pub mod app;
pub mod bulk_sync;
pub mod client;
pub mod config;
pub mod db;
pub mod discovery;
pub mod hub;
pub mod lifecycle;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod promote;
pub mod reconcile;
pub mod replicate;
pub mod retry;
pub mod server;
pub mod services;
pub mod sqlite_store;
