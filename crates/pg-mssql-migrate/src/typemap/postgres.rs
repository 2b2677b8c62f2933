//! Built-in PostgreSQL to SQL Server type table.

use crate::core::schema::{SourceType, TargetType};

/// Largest `nchar`/`nvarchar` length before `max` is required.
const MAX_NVARCHAR: u32 = 4000;

/// SQL Server decimal precision limit.
const MAX_DECIMAL_PRECISION: u32 = 38;

/// Scale used when PostgreSQL numeric has no usable precision.
const FALLBACK_DECIMAL_SCALE: u32 = 10;

fn nvarchar(length: Option<u32>) -> TargetType {
    match length {
        Some(n) if n > 0 && n <= MAX_NVARCHAR => TargetType::sized("nvarchar", n),
        _ => TargetType::max("nvarchar"),
    }
}

/// Fractional-second digits, capped at SQL Server's 7.
fn fsp(source: &SourceType) -> u32 {
    source.precision.unwrap_or(6).min(7)
}

/// Map a PostgreSQL type. Returns the target type plus a warning when the
/// value is carried in a different representation (usually text), or `None`
/// when the type is not known.
pub fn builtin(source: &SourceType) -> Option<(TargetType, Option<String>)> {
    if source.is_array() {
        return Some((
            TargetType::max("nvarchar"),
            Some(format!("array {} stored as its text literal", source.base)),
        ));
    }

    let as_text = |target: TargetType| {
        let warning = format!("{} stored as text in {}", source.base, target);
        Some((target, Some(warning)))
    };

    let exact = |target: TargetType| Some((target, None));

    match source.base.as_str() {
        "bool" => exact(TargetType::plain("bit")),
        "int2" | "smallserial" => exact(TargetType::plain("smallint")),
        "int4" | "serial" => exact(TargetType::plain("int")),
        "int8" | "bigserial" | "oid" => exact(TargetType::plain("bigint")),

        "numeric" => match (source.precision, source.scale) {
            (Some(p), s) if p > 0 && p <= MAX_DECIMAL_PRECISION => {
                exact(TargetType::decimal(p, s.unwrap_or(0)))
            }
            // Rejected by the narrowing check unless an override allows it.
            _ => exact(TargetType::decimal(MAX_DECIMAL_PRECISION, FALLBACK_DECIMAL_SCALE)),
        },
        // SQL Server money keeps only 15 integer digits.
        "money" => exact(TargetType::decimal(19, 2)),
        "float4" => exact(TargetType::plain("real")),
        "float8" => exact(TargetType::plain("float")),

        "bpchar" => match source.length {
            Some(n) if n > 0 && n <= MAX_NVARCHAR => exact(TargetType::sized("nchar", n)),
            _ => exact(TargetType::max("nvarchar")),
        },
        "varchar" => exact(nvarchar(source.length)),
        "text" => exact(TargetType::max("nvarchar")),
        "name" => exact(TargetType::sized("nvarchar", 128)),
        // Single-byte internal "char".
        "char" => exact(TargetType::sized("char", 1)),

        "bytea" => exact(TargetType::max("varbinary")),

        "date" => exact(TargetType::plain("date")),
        "time" => exact(TargetType::precision("time", fsp(source))),
        "timestamp" => exact(TargetType::precision("datetime2", fsp(source))),
        "timestamptz" => exact(TargetType::precision("datetimeoffset", fsp(source))),
        "timetz" => as_text(TargetType::sized("nvarchar", 32)),
        "interval" => as_text(TargetType::sized("nvarchar", 100)),

        "uuid" => exact(TargetType::plain("uniqueidentifier")),
        "xml" => exact(TargetType::plain("xml")),

        "json" | "jsonb" => as_text(TargetType::max("nvarchar")),
        "inet" | "cidr" => as_text(TargetType::sized("nvarchar", 50)),
        "macaddr" => as_text(TargetType::sized("nvarchar", 17)),
        "macaddr8" => as_text(TargetType::sized("nvarchar", 23)),
        "point" | "line" | "lseg" | "box" | "path" | "polygon" | "circle" => {
            as_text(TargetType::max("nvarchar"))
        }
        "tsvector" | "tsquery" => as_text(TargetType::max("nvarchar")),
        "int4range" | "int8range" | "numrange" | "tsrange" | "tstzrange" | "daterange"
        | "int4multirange" | "int8multirange" | "nummultirange" | "tsmultirange"
        | "tstzmultirange" | "datemultirange" => as_text(TargetType::max("nvarchar")),
        "bit" | "varbit" => as_text(nvarchar(source.length)),
        "enum" => as_text(nvarchar(source.length)),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ddl(source: SourceType) -> String {
        builtin(&source).map(|(t, _)| t.ddl()).unwrap_or_default()
    }

    #[test]
    fn test_numeric_types() {
        assert_eq!(ddl(SourceType::new("int4")), "int");
        assert_eq!(ddl(SourceType::new("int8")), "bigint");
        assert_eq!(ddl(SourceType::new("bool")), "bit");
        assert_eq!(ddl(SourceType::new("numeric").with_precision(18, 4)), "decimal(18,4)");
        assert_eq!(ddl(SourceType::new("numeric")), "decimal(38,10)");
        assert_eq!(ddl(SourceType::new("numeric").with_precision(50, 2)), "decimal(38,10)");
        assert_eq!(ddl(SourceType::new("money")), "decimal(19,2)");
    }

    #[test]
    fn test_string_types() {
        assert_eq!(ddl(SourceType::new("varchar").with_length(200)), "nvarchar(200)");
        assert_eq!(ddl(SourceType::new("varchar").with_length(10000)), "nvarchar(max)");
        assert_eq!(ddl(SourceType::new("varchar")), "nvarchar(max)");
        assert_eq!(ddl(SourceType::new("bpchar").with_length(3)), "nchar(3)");
        assert_eq!(ddl(SourceType::new("text")), "nvarchar(max)");
    }

    #[test]
    fn test_temporal_types() {
        let mut ts = SourceType::new("timestamp");
        ts.precision = Some(3);
        assert_eq!(ddl(ts), "datetime2(3)");
        assert_eq!(ddl(SourceType::new("timestamptz")), "datetimeoffset(6)");
        assert_eq!(ddl(SourceType::new("date")), "date");
    }

    #[test]
    fn test_text_represented_types_warn() {
        let (target, warning) = builtin(&SourceType::new("jsonb")).unwrap();
        assert_eq!(target.ddl(), "nvarchar(max)");
        assert!(warning.unwrap().contains("jsonb"));

        let (_, warning) = builtin(&SourceType::new("_int4")).unwrap();
        assert!(warning.unwrap().contains("array"));

        let (_, warning) = builtin(&SourceType::new("uuid")).unwrap();
        assert!(warning.is_none());
    }

    #[test]
    fn test_unknown_type() {
        assert!(builtin(&SourceType::new("pg_lsn")).is_none());
        assert!(builtin(&SourceType::new("hstore")).is_none());
    }
}
