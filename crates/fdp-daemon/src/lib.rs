//! fdp-daemon library target.
//!
//! Exposes the router and state for in-process router tests. The binary
//! `main.rs` depends on this library target.

pub mod api_types;
pub mod routes;
pub mod state;
