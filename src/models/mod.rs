//! Domain model module declarations.

pub mod agent;
pub mod detection;
pub mod spawn;
pub mod transcript;
