//! Castd daemon library: the encoder session controller.
//!
//! This crate supervises external encoder worker processes: it launches a
//! worker with a handshake pipe, learns the worker's bus name, drives it
//! over the control bus (configure, start, pause, stop), and mirrors the
//! worker's self-reported lifecycle state through a single observer
//! callback.

pub mod encoder;
pub mod error;
pub(crate) mod spawner;

pub use encoder::{Encoder, EncoderConfig, StateObserver};
pub use error::{EncoderError, Result};
