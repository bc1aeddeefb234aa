//! Server module
//!
//! HTTP JSON surface and its metrics endpoint.

pub mod http;
pub mod metrics;

pub use http::{create_router, serve};
