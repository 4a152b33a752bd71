//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod source;
pub mod telemetry;
pub mod transform;
