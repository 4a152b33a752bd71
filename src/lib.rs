//! imgcache: a request-time cache in front of an on-demand image transformation service.
//!
//! Incoming transformation requests are fingerprinted, serialized per artifact through a
//! keyed dedup lock, checked for freshness against a pluggable storage backend, rebuilt on a
//! miss through the external transform engine, and finally served either by redirecting to the
//! backend or by streaming the stored bytes.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
