//! Huddle Shared Types
//!
//! Identifiers and errors shared by the coordination core and its transport.

pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
