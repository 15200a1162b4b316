//! # Configuration Module
//!
//! Centralized constants for the page format, B+tree thresholds, key/value
//! limits, and the memory-map growth ladder.
//!
//! All constants are defined in the `constants` submodule and re-exported
//! here for convenient importing:
//!
//! ```ignore
//! use crate::config::{PAGE_SIZE, SPLIT_THRESHOLD};
//! ```

mod constants;

pub use constants::*;
