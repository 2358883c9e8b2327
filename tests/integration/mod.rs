//! Integration test suite for verity.
//!
//! These tests drive the public API end to end: the coordinator with real
//! worker pools and handlers, and the baseline cache with in-memory sources
//! and temporary persistent stores.
//!
//! # Test Categories
//!
//! - `coordination`: Dependency ordering, retries and failure cascades
//! - `recovery`: Deadlines, worker crashes and memory-pressure backoff
//! - `baseline_cache`: Single-flight loads, persistence, eviction and preloading
//! - `visual_e2e`: Visual tasks executed through the coordinator and cache
//!
//! # CI Compatibility
//!
//! Resource sampling uses a fixed probe and baselines are read from memory
//! or a temporary directory, so results do not depend on the host.

mod fixtures;

mod coordination;
mod recovery;
mod visual_e2e;
