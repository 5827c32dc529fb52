pub mod connection;
pub mod dataset;
pub mod query;
pub mod schema;
pub mod tabular;

pub use connection::*;
pub use dataset::*;
pub use query::*;
pub use schema::*;
pub use tabular::*;
