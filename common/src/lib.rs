//! Shared types for the Dashcast servers: configuration, HTTP protocol
//! types and the pipeline error taxonomy.

pub mod config;
pub mod error;
pub mod protocol;
