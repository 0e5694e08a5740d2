//! Common constants and types shared across the arena tracker workspace

pub mod constants;
pub mod types;

pub use types::{ParseScaleError, Scale};
