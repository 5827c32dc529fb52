pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod validation;

pub use models::*;
pub use services::{ConnectionManager, EngineContext, FileLoader, QueryBuilder, QueryExecutor};
pub use validation::*;
