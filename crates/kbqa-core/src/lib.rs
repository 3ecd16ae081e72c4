//! kbqa-core - Core types and traits for the retrieval engine
//!
//! This crate provides the foundational types, traits, and error handling
//! shared by the indexes, the cache, and the query orchestrator.

pub mod clock;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use error::{EngineError, FailureClass, Result};
pub use traits::*;
pub use types::*;
