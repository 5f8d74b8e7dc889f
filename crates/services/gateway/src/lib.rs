//! voxrelay gateway
//!
//! Browser callers connect over WebSocket at `/ws`; each connection gets one
//! [`voxrelay_core::StreamSession`] talking to the inference engine over its
//! own WebSocket. Session listing, forced close and metrics are served over
//! plain HTTP next to it.

pub mod api;
pub mod config;
pub mod connection;
pub mod engine;
pub mod knowledge;
