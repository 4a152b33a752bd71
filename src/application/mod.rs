//! Application services layer: the request pipeline and the ports it drives.

pub mod error;
pub mod orchestrator;
pub mod ports;
