//! Tapedeck - record, replay, and record-once HTTP proxy
//!
//! Responses are captured into a content-addressed store on disk, keyed by a
//! short digest of a caller-chosen projection of each request, and served back
//! byte-for-byte without contacting the upstream.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod key;
pub mod logging;
pub mod network;
pub mod pipeline;
pub mod proxy;
pub mod recording;
pub mod replay;
pub mod storage;

pub use error::{Result, TapedeckError};
