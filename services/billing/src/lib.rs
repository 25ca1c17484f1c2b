//! pulse billing service library.
//!
//! This crate primarily ships the `pulsed` binary: event watchers that
//! dispatch billing and lifecycle events to billing providers and notice
//! channels, the skew escalation engine, and the HTTP signal ingress. The
//! library surface exists for integration testing and reuse.

pub mod api;
pub mod backend;
pub mod client;
pub mod config;
pub mod notifier;
pub mod providers;
pub mod service;
pub mod skew;
pub mod state;
pub mod watchers;
