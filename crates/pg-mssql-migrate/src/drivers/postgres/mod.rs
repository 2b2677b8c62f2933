//! PostgreSQL source driver.

mod query;
mod reader;

pub use reader::PostgresReader;
