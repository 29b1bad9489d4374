//! Synchronous multi-process data-parallel training on Candle.
//!
//! Each rank owns one device and a full model replica. Replicas meet only at
//! collectives: gradient all-reduce, checkpoint broadcast, and layout checks.

pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod metrics;
pub mod models;
pub mod optim;
pub mod partition;
pub mod process_group;
pub mod replica;
pub mod scaler;
pub mod seed;
pub mod supervisor;
pub mod trainer;
pub mod transport;

pub use error::{Error, Result};
