//! Proxy service library crate.
//!
//! # Purpose
//! Exposes the configuration loader and the downstream websocket listener for
//! use by the proxy binary and integration tests.
pub mod config;
pub mod server;
