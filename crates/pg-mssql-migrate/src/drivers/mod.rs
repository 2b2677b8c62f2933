//! Database drivers.
//!
//! - [`postgres`]: PostgreSQL source reader
//! - [`mssql`]: SQL Server target writer
//! - [`common`]: shared TLS setup

pub mod common;
pub mod mssql;
pub mod postgres;

pub use common::SslMode;
pub use mssql::MssqlWriter;
pub use postgres::PostgresReader;
