//! CLI command implementations

pub mod graph;
pub mod mapping;
pub mod run;
pub mod schema;
pub mod sensor;
