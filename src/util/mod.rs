//! Small helpers shared across modules.

pub mod layout;
pub mod size;
