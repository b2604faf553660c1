//! Core types for the MIA host.
//!
//! This crate holds the small set of types every other MIA host crate
//! agrees on:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  mia-types     : ClientId, ProcessId, RequestId, ErrorCode  │ ◄── HERE
//! ├─────────────────────────────────────────────────────────────┤
//! │  mia-runtime   : supervisor, readiness, gateway, shutdown   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  mia-launcher  : host binary (config, tracing, signals)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Identifiers are UUID v4 newtypes so they can be logged, serialized
//! and sent to frontend clients without coordination.
//!
//! # Example
//!
//! ```
//! use mia_types::{ClientId, ProcessId};
//!
//! let a = ClientId::new();
//! let b = ClientId::new();
//! assert_ne!(a, b);
//! assert!(a.to_string().starts_with("client:"));
//!
//! let process = ProcessId::new();
//! assert!(process.to_string().starts_with("proc:"));
//! ```

mod error;
mod id;

pub use error::{assert_error_code, assert_error_codes, ErrorCode};
pub use id::{ClientId, ProcessId, RequestId};
