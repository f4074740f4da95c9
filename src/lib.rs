//! Proximal policy optimization for waypoint navigation agents.
//!
//! The policy update combines a clipped PPO objective with an entropy bonus decomposed over the
//! panoramic heading, offset and distance action components, an L1 penalty on continuous offsets
//! and, optionally, batches of negative visual features streamed from an on-disk feature store.
#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::missing_const_for_fn)] // has some false positives
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::redundant_closure_for_method_calls)]
#![warn(clippy::use_self)] // also triggered by macro expansions
mod error;
pub mod features;
pub mod logging;
pub mod torch;
pub mod utils;

pub use error::WaypointError;
pub use features::{NegativeLoaderConfig, NegativeSampleLoader, NegativeSource};
pub use logging::StatsLogger;
pub use torch::{PpoConfig, WaypointPpo};
