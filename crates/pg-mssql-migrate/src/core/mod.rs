//! Core abstractions shared by every stage of a migration.
//!
//! - [`schema`]: snapshot, table, column and constraint descriptors
//! - [`value`]: row values passed from source to target
//! - [`status`]: per-table copy state machine
//! - [`traits`]: source and target collaborator traits

pub mod schema;
pub mod status;
pub mod traits;
pub mod value;

pub use schema::{
    qualified_name, ArtifactDescriptor, ArtifactKind, Boundary, ColumnDescriptor, CopyStrategy,
    ForeignKeyDescriptor, ForeignKeyTarget, IndexDescriptor, KeyValue, PrimaryKeyDescriptor,
    SchemaSnapshot, SourceType, TableDescriptor, TargetType, TypeParams,
};
pub use status::TableStatus;
pub use traits::{BatchRequest, DdlKind, DdlStatement, SourceReader, TargetWriter, WriteTarget};
pub use value::{Row, SqlNullType, SqlValue};
