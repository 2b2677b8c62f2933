//! SQL Server target driver.

mod writer;

pub use writer::{MssqlWriter, TiberiusConnectionManager};
