//! xdpdns keeps the kernel eBPF maps of an XDP DNS offload in sync with
//! a set of authoritative zones: it transfers zones via AXFR/IXFR or
//! HTTP, materializes them into snapshots, diffs and cooks the result
//! into the maps, answers NOTIFY, and continuously verifies that memory,
//! blob files and kernel state agree.

/// YAML configuration tree
pub mod config;

/// DNS wire handling and the transfer client
pub mod dns;

/// prometheus counter facade
pub mod metrics;

/// health check store for the admin surface
pub mod monitor;

/// pinned map wrappers and the XDP loader
pub mod offload;

/// the data pipeline: receiver, cooker, notifier, verifier, watcher
pub mod receiver;

/// cooperative shutdown token
pub mod shutdown;

/// admin HTTP API
pub mod web;
