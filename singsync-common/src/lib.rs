//! # SingSync Common Library
//!
//! Shared code for the SingSync identification service:
//! - Result card and song match model
//! - Run event vocabulary used by the delivery channels
//! - Configuration loading
//! - SSE helpers

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod sse;

pub use error::{Error, Result};
pub use events::RunEvent;
pub use model::{CardError, ErrorKind, RankedMatch, ResultCard, SongMatch};
