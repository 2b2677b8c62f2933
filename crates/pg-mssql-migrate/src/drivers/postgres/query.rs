//! Batch SELECT rendering and row decoding for the PostgreSQL reader.

use tokio_postgres::types::FromSql;
use tokio_postgres::Row as PgRow;

use crate::core::schema::{Boundary, CopyStrategy, SourceType, TableDescriptor};
use crate::core::value::{Row, SqlNullType, SqlValue};
use crate::error::{MigrateError, Result};

/// Largest numeric precision that fits `rust_decimal`.
const MAX_DECIMAL_PRECISION: u32 = 28;

/// Quote a PostgreSQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn qualify(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// How one column is fetched and turned into a [`SqlValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decode {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    Decimal,
    Uuid,
    Date,
    Time,
    Timestamp,
    Timestamptz,
    Bytes,
    /// Read natively as a string type.
    Text,
    /// Cast to text on the server.
    CastText,
}

impl Decode {
    pub(crate) fn for_type(source: &SourceType) -> Self {
        match source.base.as_str() {
            "bool" => Decode::Bool,
            "int2" | "smallserial" => Decode::I16,
            "int4" | "serial" => Decode::I32,
            "int8" | "bigserial" => Decode::I64,
            "float4" => Decode::F32,
            "float8" => Decode::F64,
            "numeric" => match source.precision {
                Some(p) if p <= MAX_DECIMAL_PRECISION => Decode::Decimal,
                _ => Decode::CastText,
            },
            "money" => Decode::Decimal,
            "uuid" => Decode::Uuid,
            "date" => Decode::Date,
            "time" => Decode::Time,
            "timestamp" => Decode::Timestamp,
            "timestamptz" => Decode::Timestamptz,
            "bytea" => Decode::Bytes,
            "varchar" | "text" | "bpchar" | "name" => Decode::Text,
            _ => Decode::CastText,
        }
    }
}

/// SELECT-list expression for a column.
pub(crate) fn projection(name: &str, source: &SourceType) -> String {
    let col = quote_ident(name);
    match (source.base.as_str(), Decode::for_type(source)) {
        ("money", _) => format!("{}::numeric", col),
        (_, Decode::CastText) => format!("{}::text", col),
        _ => col,
    }
}

/// Render the SELECT for one batch.
///
/// Keyed tables order by the primary key; keyless tables page in physical
/// order, which stays stable only while the source is not being written.
pub(crate) fn build_select(
    table: &TableDescriptor,
    after: Option<&Boundary>,
    limit: usize,
) -> Result<String> {
    let columns = table
        .columns
        .iter()
        .map(|c| projection(&c.name, &c.source))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "SELECT {} FROM {}",
        columns,
        qualify(&table.schema, &table.name)
    );

    let keys = table
        .key_columns()
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");

    let mismatch = |b: &Boundary| {
        MigrateError::structural(
            table.qualified_name(),
            format!("checkpoint boundary {:?} does not fit the copy strategy", b),
        )
    };

    match table.copy_strategy() {
        CopyStrategy::Keyset => {
            match after {
                None => {}
                Some(Boundary::Key(values)) if values.len() == table.key_columns().len() => {
                    let literals = values
                        .iter()
                        .map(|v| v.to_pg_literal())
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(&format!(" WHERE ({}) > ({})", keys, literals));
                }
                Some(other) => return Err(mismatch(other)),
            }
            sql.push_str(&format!(" ORDER BY {} LIMIT {}", keys, limit));
        }
        CopyStrategy::KeyedOffset | CopyStrategy::Keyless => {
            let offset = match after {
                None => 0,
                Some(Boundary::Offset(n)) => *n,
                Some(other) => return Err(mismatch(other)),
            };
            // ctid repeats across partitions; tableoid disambiguates.
            let order = if table.copy_strategy() == CopyStrategy::Keyless {
                "tableoid, ctid".to_string()
            } else {
                keys
            };
            sql.push_str(&format!(
                " ORDER BY {} OFFSET {} LIMIT {}",
                order, offset, limit
            ));
        }
    }

    Ok(sql)
}

fn get<'a, T: FromSql<'a>>(
    row: &'a PgRow,
    idx: usize,
    null: SqlNullType,
    wrap: impl FnOnce(T) -> SqlValue,
) -> std::result::Result<SqlValue, tokio_postgres::Error> {
    Ok(row
        .try_get::<_, Option<T>>(idx)?
        .map(wrap)
        .unwrap_or(SqlValue::Null(null)))
}

fn decode_value(
    row: &PgRow,
    idx: usize,
    decode: Decode,
) -> std::result::Result<SqlValue, tokio_postgres::Error> {
    match decode {
        Decode::Bool => get(row, idx, SqlNullType::Bool, SqlValue::Bool),
        Decode::I16 => get(row, idx, SqlNullType::I16, SqlValue::I16),
        Decode::I32 => get(row, idx, SqlNullType::I32, SqlValue::I32),
        Decode::I64 => get(row, idx, SqlNullType::I64, SqlValue::I64),
        Decode::F32 => get(row, idx, SqlNullType::F32, SqlValue::F32),
        Decode::F64 => get(row, idx, SqlNullType::F64, SqlValue::F64),
        Decode::Decimal => get(row, idx, SqlNullType::Decimal, SqlValue::Decimal),
        Decode::Uuid => get(row, idx, SqlNullType::Uuid, SqlValue::Uuid),
        Decode::Date => get(row, idx, SqlNullType::Date, SqlValue::Date),
        Decode::Time => get(row, idx, SqlNullType::Time, SqlValue::Time),
        Decode::Timestamp => get(row, idx, SqlNullType::DateTime, SqlValue::DateTime),
        Decode::Timestamptz => get(
            row,
            idx,
            SqlNullType::DateTimeOffset,
            SqlValue::DateTimeOffset,
        ),
        Decode::Bytes => get(row, idx, SqlNullType::Bytes, SqlValue::Bytes),
        Decode::Text | Decode::CastText => get(row, idx, SqlNullType::String, SqlValue::Text),
    }
}

/// Decode one result row in column order.
pub(crate) fn decode_row(row: &PgRow, plan: &[Decode]) -> Result<Row> {
    plan.iter()
        .enumerate()
        .map(|(idx, decode)| decode_value(row, idx, *decode).map_err(MigrateError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::{ColumnDescriptor, KeyValue, PrimaryKeyDescriptor};

    fn table(keys: &[&str]) -> TableDescriptor {
        let mut t = TableDescriptor::new("public", "line_items");
        t.columns = vec![
            ColumnDescriptor::new("order_id", 1, SourceType::new("int8").not_null()),
            ColumnDescriptor::new("sku", 2, SourceType::new("varchar").with_length(32)),
            ColumnDescriptor::new("price", 3, SourceType::new("money")),
            ColumnDescriptor::new("attrs", 4, SourceType::new("jsonb")),
        ];
        if !keys.is_empty() {
            t.primary_key = Some(PrimaryKeyDescriptor {
                name: "line_items_pkey".into(),
                columns: keys.iter().map(|k| k.to_string()).collect(),
            });
        }
        t
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualify("public", "t"), "\"public\".\"t\"");
    }

    #[test]
    fn test_decode_choice() {
        assert_eq!(Decode::for_type(&SourceType::new("serial")), Decode::I32);
        assert_eq!(
            Decode::for_type(&SourceType::new("numeric").with_precision(12, 2)),
            Decode::Decimal
        );
        assert_eq!(Decode::for_type(&SourceType::new("numeric")), Decode::CastText);
        assert_eq!(
            Decode::for_type(&SourceType::new("numeric").with_precision(38, 4)),
            Decode::CastText
        );
        assert_eq!(Decode::for_type(&SourceType::new("_int4")), Decode::CastText);
        assert_eq!(Decode::for_type(&SourceType::new("bpchar")), Decode::Text);
    }

    #[test]
    fn test_projection_casts() {
        assert_eq!(projection("price", &SourceType::new("money")), "\"price\"::numeric");
        assert_eq!(projection("attrs", &SourceType::new("jsonb")), "\"attrs\"::text");
        assert_eq!(projection("mood", &SourceType::new("enum")), "\"mood\"::text");
        assert_eq!(projection("id", &SourceType::new("int8")), "\"id\"");
    }

    #[test]
    fn test_keyset_select() {
        let t = table(&["order_id", "sku"]);
        let first = build_select(&t, None, 500).unwrap();
        assert_eq!(
            first,
            "SELECT \"order_id\", \"sku\", \"price\"::numeric, \"attrs\"::text \
             FROM \"public\".\"line_items\" ORDER BY \"order_id\", \"sku\" LIMIT 500"
        );

        let boundary = Boundary::Key(vec![KeyValue::Int(42), KeyValue::Text("A'1".into())]);
        let next = build_select(&t, Some(&boundary), 500).unwrap();
        assert!(next.contains("WHERE (\"order_id\", \"sku\") > (42, 'A''1')"));
    }

    #[test]
    fn test_offset_selects() {
        let keyless = table(&[]);
        let sql = build_select(&keyless, Some(&Boundary::Offset(1000)), 100).unwrap();
        assert!(sql.ends_with("ORDER BY tableoid, ctid OFFSET 1000 LIMIT 100"));
        let first = build_select(&keyless, None, 100).unwrap();
        assert!(first.ends_with("ORDER BY tableoid, ctid OFFSET 0 LIMIT 100"));

        let mut keyed = table(&["attrs"]);
        keyed.columns[3].source = SourceType::new("jsonb").not_null();
        let sql = build_select(&keyed, None, 10).unwrap();
        assert!(sql.ends_with("ORDER BY \"attrs\" OFFSET 0 LIMIT 10"));
    }

    #[test]
    fn test_boundary_mismatch_is_structural() {
        let t = table(&["order_id"]);
        let err = build_select(&t, Some(&Boundary::Offset(5)), 10).unwrap_err();
        assert_eq!(err.kind(), "copy_structural");

        let short = Boundary::Key(vec![]);
        assert!(build_select(&t, Some(&short), 10).is_err());
    }
}
