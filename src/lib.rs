//! Sentinel - Per-Client Request Admission
//!
//! This crate counts requests per client identity (source address, or
//! address plus API token) and temporarily rejects clients that exceed a
//! configured limit. Counters live in a pluggable store, either in-process
//! or on a Redis-compatible server, and idle records are evicted in the
//! background.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod storage;
