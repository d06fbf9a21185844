//! plugchain - Host audio plugins in a chain and stream the result
//!
//! This library loads native DSP plugins, chains them over a file or live
//! input source, and streams the processed audio to an output device with
//! bounded latency.

pub mod audio;
pub mod config;

pub use audio::{AudioError, Chain, StreamEngine};
pub use config::AppConfig;
