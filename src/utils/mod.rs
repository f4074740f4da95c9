//! General utilities
pub mod fmt;
pub mod shuffle;
pub mod stats;
