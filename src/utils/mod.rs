//! Utility modules and shared functionality

pub mod errors;
pub mod text;
