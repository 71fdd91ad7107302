//! Operator display API
//!
//! - `common`: response envelope and the validating JSON extractor
//! - `modules`: charging, health and metrics handlers
//! - `router`: router with Swagger documentation

pub mod common;
pub mod modules;
pub mod router;

pub use router::create_display_router;
