//! Shared types for the chasper client: data models, realtime frames and errors.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
