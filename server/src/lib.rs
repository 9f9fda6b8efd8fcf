//! Rollcall Server - session check-in and attendance lifecycle.
//!
//! This crate provides the server side of Rollcall, responsible for:
//! - Issuing appointment and per-participant check-in codes
//! - Redeeming scanned codes and recording attendance
//! - Starting sessions manually or automatically once everyone is present
//! - Finalizing sessions, on request or when they come due
//! - Streaming the attendance ledger to live subscribers
//!
//! # Architecture
//!
//! [`lifecycle::SessionLifecycleManager`] is the single entry point for state
//! changes. It works against the [`store::RecordStore`] trait, whose guarded
//! updates keep concurrent scans from double-starting or double-finalizing a
//! session. Identity is asserted by a trusted gateway through request
//! headers (see [`identity`]).

pub mod aggregator;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod lifecycle;
pub mod registry;
pub mod routes;
pub mod scheduler;
pub mod store;
pub mod token;
pub mod types;
pub mod window;
