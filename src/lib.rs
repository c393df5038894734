// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export everything for both `main.rs` and
// integration tests.

pub mod macros;

pub mod actions;
pub mod comms;
pub mod config;
pub mod policy;
