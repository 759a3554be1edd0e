//! Cadence Core
//!
//! Domain types, port traits, and error handling for the Cadence scheduler.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, the in-memory store, and the server binary.

pub mod agent;
pub mod config;
pub mod elastic;
pub mod error;
pub mod events;
pub mod health;
pub mod ids;
pub mod job;
pub mod material;
pub mod ports;
pub mod result;
pub mod run;
pub mod secrets;

pub use error::{Error, Result};
pub use ids::*;
