//! Command implementations

pub mod list;
pub mod status;
pub mod tasks;
