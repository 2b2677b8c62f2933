//! Schema snapshot and descriptor types.
//!
//! A [`SchemaSnapshot`] owns every table and artifact descriptor for one run.
//! Tables reference each other by qualified name only, so the snapshot stays a
//! plain tree even when the foreign-key graph is cyclic.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::value::SqlValue;

/// Build the `schema.table` key used throughout the engine.
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

/// Column type as reported by the source catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceType {
    /// Base type name (`int4`, `varchar`, `numeric`, `_text` for arrays, `enum`).
    pub base: String,

    /// Character or bit length, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,

    /// Numeric precision, or fractional-second digits for temporal types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,

    /// Numeric scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,

    pub nullable: bool,

    /// Default expression in source syntax. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Identity or serial column.
    #[serde(default)]
    pub is_identity: bool,
}

impl SourceType {
    /// Plain type with no parameters.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            length: None,
            precision: None,
            scale: None,
            nullable: true,
            default: None,
            is_identity: false,
        }
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self.nullable = false;
        self
    }

    /// Array element types are reported with a leading underscore.
    pub fn is_array(&self) -> bool {
        self.base.starts_with('_')
    }

    /// Whether keyset pagination can compare values of this type.
    pub fn is_keyable(&self) -> bool {
        matches!(
            self.base.as_str(),
            "int2"
                | "int4"
                | "int8"
                | "smallserial"
                | "serial"
                | "bigserial"
                | "numeric"
                | "varchar"
                | "bpchar"
                | "text"
                | "name"
                | "uuid"
                | "date"
                | "timestamp"
                | "timestamptz"
                | "bool"
        )
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.length, self.precision, self.scale) {
            (Some(len), _, _) => write!(f, "{}({})", self.base, len),
            (None, Some(p), Some(s)) if self.base == "numeric" => {
                write!(f, "{}({},{})", self.base, p, s)
            }
            _ => write!(f, "{}", self.base),
        }
    }
}

/// Parameters of a target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeParams {
    None,
    Length(u32),
    Max,
    Precision(u32),
    PrecisionScale(u32, u32),
}

/// Column type in the target dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetType {
    pub name: String,
    pub params: TypeParams,
}

impl TargetType {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: TypeParams::None,
        }
    }

    pub fn sized(name: impl Into<String>, length: u32) -> Self {
        Self {
            name: name.into(),
            params: TypeParams::Length(length),
        }
    }

    pub fn max(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: TypeParams::Max,
        }
    }

    pub fn precision(name: impl Into<String>, precision: u32) -> Self {
        Self {
            name: name.into(),
            params: TypeParams::Precision(precision),
        }
    }

    pub fn decimal(precision: u32, scale: u32) -> Self {
        Self {
            name: "decimal".into(),
            params: TypeParams::PrecisionScale(precision, scale),
        }
    }

    /// Parse a DDL fragment such as `decimal(38,10)`, `nvarchar(max)` or `int`.
    pub fn parse(ddl: &str) -> Option<Self> {
        let ddl = ddl.trim();
        let (name, params) = match ddl.find('(') {
            None => (ddl, TypeParams::None),
            Some(open) => {
                let close = ddl.rfind(')')?;
                if close < open || close != ddl.len() - 1 {
                    return None;
                }
                let inner = ddl[open + 1..close].trim();
                let params = if inner.eq_ignore_ascii_case("max") {
                    TypeParams::Max
                } else if let Some((p, s)) = inner.split_once(',') {
                    TypeParams::PrecisionScale(p.trim().parse().ok()?, s.trim().parse().ok()?)
                } else {
                    let n: u32 = inner.parse().ok()?;
                    if is_length_type(&ddl[..open].trim().to_lowercase()) {
                        TypeParams::Length(n)
                    } else {
                        TypeParams::Precision(n)
                    }
                };
                (ddl[..open].trim(), params)
            }
        };

        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ' ') {
            return None;
        }

        Some(Self {
            name: name.to_lowercase(),
            params,
        })
    }

    /// Materialized DDL fragment.
    pub fn ddl(&self) -> String {
        match self.params {
            TypeParams::None => self.name.clone(),
            TypeParams::Length(n) | TypeParams::Precision(n) => format!("{}({})", self.name, n),
            TypeParams::Max => format!("{}(max)", self.name),
            TypeParams::PrecisionScale(p, s) => format!("{}({},{})", self.name, p, s),
        }
    }
}

fn is_length_type(name: &str) -> bool {
    matches!(
        name,
        "char" | "nchar" | "varchar" | "nvarchar" | "binary" | "varbinary"
    )
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ddl())
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,

    /// 1-based ordinal position in the source table.
    pub ordinal: u32,

    pub source: SourceType,

    /// Filled in by the type mapper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetType>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, ordinal: u32, source: SourceType) -> Self {
        Self {
            name: name.into(),
            ordinal,
            source,
            target: None,
        }
    }
}

/// Primary key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyDescriptor {
    pub name: String,
    pub columns: Vec<String>,
}

/// Secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

/// Whether a foreign key's referenced table is part of the migrated set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyTarget {
    Internal,
    /// Referenced table is outside the extracted scope. Recorded, never created.
    External,
}

/// Foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub ref_schema: String,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
    /// Referential action (`NO_ACTION`, `CASCADE`, `SET_NULL`, ...).
    pub on_delete: String,
    pub on_update: String,
    pub target: ForeignKeyTarget,
}

impl ForeignKeyDescriptor {
    /// Qualified name of the referenced table.
    pub fn referenced(&self) -> String {
        qualified_name(&self.ref_schema, &self.ref_table)
    }

    pub fn is_external(&self) -> bool {
        self.target == ForeignKeyTarget::External
    }
}

/// How rows of a table are ordered and paged during copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Primary key of comparable types: `WHERE key > boundary ORDER BY key`.
    Keyset,
    /// Primary key exists but cannot be compared as a literal: offset paging
    /// ordered by the key, upserts stay idempotent.
    KeyedOffset,
    /// No primary key: offset paging in physical order, plain inserts.
    Keyless,
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<PrimaryKeyDescriptor>,
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    /// Exact row count captured at extraction time.
    pub row_count: u64,
}

impl TableDescriptor {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            primary_key: None,
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            row_count: 0,
        }
    }

    /// Get the fully qualified table name.
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Primary key column names, empty for keyless tables.
    pub fn key_columns(&self) -> &[String] {
        self.primary_key
            .as_ref()
            .map(|pk| pk.columns.as_slice())
            .unwrap_or(&[])
    }

    /// Positions of the key columns within [`TableDescriptor::columns`].
    pub fn key_positions(&self) -> Vec<usize> {
        self.key_columns()
            .iter()
            .filter_map(|k| self.columns.iter().position(|c| &c.name == k))
            .collect()
    }

    pub fn has_identity(&self) -> bool {
        self.columns.iter().any(|c| c.source.is_identity)
    }

    pub fn copy_strategy(&self) -> CopyStrategy {
        let keys = self.key_columns();
        if keys.is_empty() {
            return CopyStrategy::Keyless;
        }
        let keyable = keys
            .iter()
            .all(|k| self.column(k).map(|c| c.source.is_keyable()).unwrap_or(false));
        if keyable {
            CopyStrategy::Keyset
        } else {
            CopyStrategy::KeyedOffset
        }
    }
}

/// Kind of non-table object exported as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    View,
    Function,
    Procedure,
    Trigger,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::View => "view",
            ArtifactKind::Function => "function",
            ArtifactKind::Procedure => "procedure",
            ArtifactKind::Trigger => "trigger",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// View, routine or trigger definition, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub kind: ArtifactKind,
    pub schema: String,
    pub name: String,
    /// Argument list for routines, owning table for triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub definition: String,
    /// Qualified names of tables the object reads from, when the catalog knows.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ArtifactDescriptor {
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }
}

/// Immutable result of metadata extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, TableDescriptor>,
    artifacts: Vec<ArtifactDescriptor>,
}

impl SchemaSnapshot {
    pub fn new(
        tables: impl IntoIterator<Item = TableDescriptor>,
        artifacts: Vec<ArtifactDescriptor>,
    ) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|t| (t.qualified_name(), t))
                .collect(),
            artifacts,
        }
    }

    pub fn table(&self, qualified: &str) -> Option<&TableDescriptor> {
        self.tables.get(qualified)
    }

    pub fn contains(&self, qualified: &str) -> bool {
        self.tables.contains_key(qualified)
    }

    /// Tables in qualified-name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }

    pub fn artifacts(&self) -> &[ArtifactDescriptor] {
        &self.artifacts
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Whether every column carries a target type.
    pub fn is_mapped(&self) -> bool {
        self.tables()
            .all(|t| t.columns.iter().all(|c| c.target.is_some()))
    }

    /// Split into parts so a mapper can rebuild a new snapshot.
    pub fn into_parts(self) -> (Vec<TableDescriptor>, Vec<ArtifactDescriptor>) {
        (self.tables.into_values().collect(), self.artifacts)
    }
}

/// Ordering-key value stored in a checkpoint boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KeyValue {
    Int(i64),
    Decimal(Decimal),
    Text(String),
    Uuid(Uuid),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Timestamptz(DateTime<FixedOffset>),
}

impl KeyValue {
    /// Extract a key value from a row value. NULL and non-comparable values
    /// cannot serve as a boundary.
    pub fn from_sql_value(value: &SqlValue) -> Option<Self> {
        match value {
            SqlValue::I16(v) => Some(KeyValue::Int(i64::from(*v))),
            SqlValue::I32(v) => Some(KeyValue::Int(i64::from(*v))),
            SqlValue::I64(v) => Some(KeyValue::Int(*v)),
            SqlValue::Decimal(v) => Some(KeyValue::Decimal(*v)),
            SqlValue::Text(v) => Some(KeyValue::Text(v.clone())),
            SqlValue::Uuid(v) => Some(KeyValue::Uuid(*v)),
            SqlValue::Bool(v) => Some(KeyValue::Bool(*v)),
            SqlValue::Date(v) => Some(KeyValue::Date(*v)),
            SqlValue::DateTime(v) => Some(KeyValue::Timestamp(*v)),
            SqlValue::DateTimeOffset(v) => Some(KeyValue::Timestamptz(*v)),
            _ => None,
        }
    }

    /// Convert to a PostgreSQL literal with an explicit cast.
    ///
    /// Strings are escaped by doubling single quotes; values come from rows
    /// already read from the source, never from user input.
    pub fn to_pg_literal(&self) -> String {
        match self {
            KeyValue::Int(v) => v.to_string(),
            KeyValue::Decimal(v) => format!("{}::numeric", v),
            KeyValue::Text(v) => format!("'{}'", v.replace('\'', "''")),
            KeyValue::Uuid(v) => format!("'{}'::uuid", v),
            KeyValue::Bool(v) => v.to_string(),
            KeyValue::Date(v) => format!("'{}'::date", v),
            KeyValue::Timestamp(v) => format!("'{}'::timestamp", v),
            KeyValue::Timestamptz(v) => format!("'{}'::timestamptz", v.to_rfc3339()),
        }
    }
}

/// Durable position in a table's copy stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    /// Last committed ordering-key tuple.
    Key(Vec<KeyValue>),
    /// Number of rows committed in ordering order.
    Offset(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableDescriptor {
        let mut t = TableDescriptor::new("public", "orders");
        t.columns = vec![
            ColumnDescriptor::new("id", 1, SourceType::new("int8").identity()),
            ColumnDescriptor::new("note", 2, SourceType::new("text")),
        ];
        t.primary_key = Some(PrimaryKeyDescriptor {
            name: "orders_pkey".into(),
            columns: vec!["id".into()],
        });
        t
    }

    #[test]
    fn test_target_type_parse() {
        assert_eq!(TargetType::parse("decimal(38, 10)"), Some(TargetType::decimal(38, 10)));
        assert_eq!(TargetType::parse("NVARCHAR(MAX)"), Some(TargetType::max("nvarchar")));
        assert_eq!(TargetType::parse("nvarchar(200)"), Some(TargetType::sized("nvarchar", 200)));
        assert_eq!(TargetType::parse("datetime2(3)"), Some(TargetType::precision("datetime2", 3)));
        assert_eq!(TargetType::parse("int"), Some(TargetType::plain("int")));
        assert_eq!(TargetType::parse("int); drop table x; --"), None);
        assert_eq!(TargetType::parse(""), None);
    }

    #[test]
    fn test_target_type_ddl() {
        assert_eq!(TargetType::decimal(18, 4).ddl(), "decimal(18,4)");
        assert_eq!(TargetType::max("varbinary").ddl(), "varbinary(max)");
        assert_eq!(TargetType::plain("bit").ddl(), "bit");
    }

    #[test]
    fn test_copy_strategy() {
        let mut t = orders();
        assert_eq!(t.copy_strategy(), CopyStrategy::Keyset);
        assert_eq!(t.key_positions(), vec![0]);
        assert!(t.has_identity());

        t.columns[0].source = SourceType::new("bytea");
        assert_eq!(t.copy_strategy(), CopyStrategy::KeyedOffset);

        t.primary_key = None;
        assert_eq!(t.copy_strategy(), CopyStrategy::Keyless);
    }

    #[test]
    fn test_snapshot_lookup_is_by_qualified_name() {
        let snapshot = SchemaSnapshot::new(vec![orders()], vec![]);
        assert!(snapshot.contains("public.orders"));
        assert!(!snapshot.contains("orders"));
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot.is_mapped());
    }

    #[test]
    fn test_key_value_literals() {
        assert_eq!(KeyValue::Int(42).to_pg_literal(), "42");
        assert_eq!(KeyValue::Text("O'Brien".into()).to_pg_literal(), "'O''Brien'");
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(KeyValue::Date(date).to_pg_literal(), "'2024-02-29'::date");
    }

    #[test]
    fn test_key_value_from_sql_value() {
        assert_eq!(KeyValue::from_sql_value(&SqlValue::I32(7)), Some(KeyValue::Int(7)));
        assert_eq!(KeyValue::from_sql_value(&SqlValue::F64(1.5)), None);
        assert_eq!(
            KeyValue::from_sql_value(&SqlValue::Null(crate::core::value::SqlNullType::I32)),
            None
        );
    }

    #[test]
    fn test_boundary_serde() {
        let b = Boundary::Key(vec![KeyValue::Int(10), KeyValue::Text("x".into())]);
        let json = serde_json::to_string(&b).unwrap();
        let back: Boundary = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }
}
