//! Rewind - record/replay debugging control plane
//!
//! Coordinates one recording child and a pool of replaying children so a
//! debugger can pause, step and resume in either direction through a
//! recorded execution.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod checkpoint;
pub mod child;
pub mod config;
pub mod control;
pub mod driver;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod point;

pub use control::Controller;
pub use error::{Result, RewindError};
