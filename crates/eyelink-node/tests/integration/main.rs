//! Integration test entry point for eyelink-node.
//!
//! Every test runs a real server and real eyes over loopback UDP and TCP in
//! one tokio runtime. Each test owns a distinct control-port range.
//!
//! Run with: cargo test --test integration -- --test-threads=1

mod harness;
mod registration;
mod supervision;
mod vision;
