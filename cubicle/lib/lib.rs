//! `cubicle` is a control plane for per-user cloud developer sandboxes.
//!
//! # Overview
//!
//! cubicle creates isolated sandboxes for untrusted developer workloads, executes
//! commands inside them, captures and restores their filesystem state as compressed
//! archives, and exposes preview ports of in-sandbox servers to external HTTP
//! clients through a reverse proxy. It handles:
//! - Sandbox lifecycle and command execution with pluggable isolation backends
//! - Filesystem snapshots with pluggable blob storage and per-user retention
//! - Preview-port reverse proxying with fallback promotion on upstream failure
//! - Per-sandbox quota admission and resource accounting
//!
//! # Architecture
//!
//! cubicle consists of several key components:
//!
//! - **Storage**: blob backends (local filesystem, S3-compatible object store)
//! - **Snapshot**: tar + zstd workspace archives with atomic restore
//! - **Isolation**: microVM, container, and process drivers behind one trait
//! - **Quota**: per-sandbox admission over rolling execution windows
//! - **Runtime**: per-sandbox state, exec, files, background jobs, previews
//! - **Proxy**: streaming HTTP/WebSocket reverse proxy for preview ports
//! - **Server**: REST façade over the runtime, snapshots, and proxy
//!
//! # Modules
//!
//! - [`config`] - Typed configuration and defaults
//! - [`isolation`] - Sandbox isolation drivers
//! - [`metrics`] - Prometheus metric handles and text exposition
//! - [`proxy`] - Preview-port reverse proxy
//! - [`quota`] - Quota buckets and admission
//! - [`runtime`] - Sandbox runtime and supervision
//! - [`server`] - HTTP façade
//! - [`snapshot`] - Snapshot engine and archive codec
//! - [`storage`] - Blob storage backends
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod config;
pub mod isolation;
pub mod metrics;
pub mod proxy;
pub mod quota;
pub mod runtime;
pub mod server;
pub mod snapshot;
pub mod storage;
pub mod utils;

pub use error::*;
