//! Value domains used to detect narrowing mappings.
//!
//! Both sides of a mapping are classified into a [`ValueDomain`]. A mapping is
//! narrowing when some value of the source domain has no exact representation
//! in the target domain.

use crate::core::schema::{SourceType, TargetType, TypeParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDomain {
    Boolean,
    Integer { bits: u8 },
    /// `precision: None` is arbitrary precision.
    Decimal { precision: Option<u32>, scale: u32 },
    Float { bits: u8 },
    /// `max_chars: None` is unbounded.
    Text { max_chars: Option<u32>, unicode: bool },
    Binary { max_bytes: Option<u32> },
    Date,
    Time { fsp: u32 },
    Timestamp { fsp: u32, zoned: bool },
    Uuid,
    /// Target type the checker does not know.
    Unknown,
}

/// Decimal digits needed for the full range of a signed integer.
fn integer_digits(bits: u8) -> u32 {
    match bits {
        0..=8 => 3,
        9..=16 => 5,
        17..=32 => 10,
        _ => 19,
    }
}

/// Classify a PostgreSQL column type.
pub fn source_domain(source: &SourceType) -> ValueDomain {
    if source.is_array() {
        return ValueDomain::Text { max_chars: None, unicode: true };
    }
    match source.base.as_str() {
        "bool" => ValueDomain::Boolean,
        "int2" | "smallserial" => ValueDomain::Integer { bits: 16 },
        "int4" | "serial" => ValueDomain::Integer { bits: 32 },
        // oid is unsigned 32-bit
        "int8" | "bigserial" | "oid" => ValueDomain::Integer { bits: 64 },
        "numeric" => ValueDomain::Decimal {
            precision: source.precision,
            scale: source.scale.unwrap_or(0),
        },
        "money" => ValueDomain::Decimal { precision: Some(19), scale: 2 },
        "float4" => ValueDomain::Float { bits: 32 },
        "float8" => ValueDomain::Float { bits: 64 },
        "varchar" | "bpchar" => ValueDomain::Text { max_chars: source.length, unicode: true },
        "text" => ValueDomain::Text { max_chars: None, unicode: true },
        "name" => ValueDomain::Text { max_chars: Some(63), unicode: true },
        "char" => ValueDomain::Text { max_chars: Some(1), unicode: false },
        "enum" => ValueDomain::Text { max_chars: source.length, unicode: true },
        "bytea" => ValueDomain::Binary { max_bytes: None },
        "date" => ValueDomain::Date,
        "time" => ValueDomain::Time { fsp: source.precision.unwrap_or(6) },
        "timestamp" => ValueDomain::Timestamp { fsp: source.precision.unwrap_or(6), zoned: false },
        "timestamptz" => ValueDomain::Timestamp { fsp: source.precision.unwrap_or(6), zoned: true },
        "uuid" => ValueDomain::Uuid,
        // Copied through their text representation.
        "timetz" => ValueDomain::Text { max_chars: Some(32), unicode: false },
        "interval" => ValueDomain::Text { max_chars: Some(100), unicode: false },
        "inet" | "cidr" => ValueDomain::Text { max_chars: Some(43), unicode: false },
        "macaddr" => ValueDomain::Text { max_chars: Some(17), unicode: false },
        "macaddr8" => ValueDomain::Text { max_chars: Some(23), unicode: false },
        "bit" | "varbit" => ValueDomain::Text { max_chars: source.length, unicode: false },
        _ => ValueDomain::Text { max_chars: None, unicode: true },
    }
}

/// Classify a SQL Server column type.
pub fn target_domain(target: &TargetType) -> ValueDomain {
    let length = match target.params {
        TypeParams::Length(n) | TypeParams::Precision(n) => Some(n),
        TypeParams::Max => None,
        _ => Some(1),
    };
    let fsp = match target.params {
        TypeParams::Precision(n) => n,
        _ => 7,
    };

    match target.name.as_str() {
        "bit" => ValueDomain::Boolean,
        // tinyint is unsigned 0..255; 8 bits would claim -128..127 fits
        "tinyint" => ValueDomain::Integer { bits: 7 },
        "smallint" => ValueDomain::Integer { bits: 16 },
        "int" => ValueDomain::Integer { bits: 32 },
        "bigint" => ValueDomain::Integer { bits: 64 },
        "decimal" | "numeric" => {
            let (precision, scale) = match target.params {
                TypeParams::PrecisionScale(p, s) => (p, s),
                TypeParams::Precision(p) => (p, 0),
                _ => (18, 0),
            };
            ValueDomain::Decimal { precision: Some(precision), scale }
        }
        "money" => ValueDomain::Decimal { precision: Some(19), scale: 4 },
        "smallmoney" => ValueDomain::Decimal { precision: Some(10), scale: 4 },
        "real" => ValueDomain::Float { bits: 32 },
        "float" => match target.params {
            TypeParams::Precision(n) if n <= 24 => ValueDomain::Float { bits: 32 },
            _ => ValueDomain::Float { bits: 64 },
        },
        "nchar" | "nvarchar" => ValueDomain::Text { max_chars: length, unicode: true },
        "char" | "varchar" => ValueDomain::Text { max_chars: length, unicode: false },
        "ntext" | "xml" => ValueDomain::Text { max_chars: None, unicode: true },
        "text" => ValueDomain::Text { max_chars: None, unicode: false },
        "binary" | "varbinary" => ValueDomain::Binary { max_bytes: length },
        "image" => ValueDomain::Binary { max_bytes: None },
        "date" => ValueDomain::Date,
        "time" => ValueDomain::Time { fsp },
        "datetime2" => ValueDomain::Timestamp { fsp, zoned: false },
        "datetime" => ValueDomain::Timestamp { fsp: 2, zoned: false },
        "smalldatetime" => ValueDomain::Timestamp { fsp: 0, zoned: false },
        "datetimeoffset" => ValueDomain::Timestamp { fsp, zoned: true },
        "uniqueidentifier" => ValueDomain::Uuid,
        _ => ValueDomain::Unknown,
    }
}

fn bounded_fits(source: Option<u32>, target: Option<u32>) -> bool {
    match (source, target) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(s), Some(t)) => t >= s,
    }
}

/// Check that every value of `source` is representable in `target`.
/// Returns the reason when it is not.
pub fn check_widening(source: ValueDomain, target: ValueDomain) -> Result<(), String> {
    use ValueDomain::*;

    let ok = match (source, target) {
        (_, Unknown) => return Err("target type is not recognized".into()),
        (Boolean, Boolean) => true,
        (Boolean, Integer { .. }) => true,
        (Integer { bits: s }, Integer { bits: t }) => t >= s,
        (Integer { bits }, Decimal { precision: Some(p), scale }) => {
            p.saturating_sub(scale) >= integer_digits(bits)
        }
        (Integer { bits }, Float { bits: f }) => integer_digits(bits) <= if f == 64 { 15 } else { 6 },
        (Decimal { precision: None, .. }, Decimal { .. }) => {
            return Err("unconstrained numeric has no fixed precision".into())
        }
        (Decimal { precision: Some(p), scale: s }, Decimal { precision: Some(q), scale: t }) => {
            if t < s {
                return Err(format!("scale {} reduced to {}", s, t));
            }
            if q.saturating_sub(t) < p.saturating_sub(s) {
                return Err(format!(
                    "integer digits {} reduced to {}",
                    p.saturating_sub(s),
                    q.saturating_sub(t)
                ));
            }
            true
        }
        (Float { bits: s }, Float { bits: t }) => t >= s,
        (Text { max_chars: s, unicode: su }, Text { max_chars: t, unicode: tu }) => {
            if su && !tu {
                return Err("non-Unicode target for Unicode text".into());
            }
            if !bounded_fits(s, t) {
                return Err(match (s, t) {
                    (Some(s), Some(t)) => format!("length {} reduced to {}", s, t),
                    _ => "unbounded text stored in bounded column".into(),
                });
            }
            true
        }
        // Text renderings of uuid and numbers always fit a wide enough column.
        (Uuid, Text { max_chars, .. }) => bounded_fits(Some(36), max_chars),
        (Integer { bits }, Text { max_chars, .. }) => {
            bounded_fits(Some(integer_digits(bits) + 1), max_chars)
        }
        (Binary { max_bytes: s }, Binary { max_bytes: t }) => bounded_fits(s, t),
        (Date, Date) => true,
        (Date, Timestamp { .. }) => true,
        (Time { fsp: s }, Time { fsp: t }) => {
            if t < s {
                return Err(format!("fractional seconds {} reduced to {}", s, t));
            }
            true
        }
        (Timestamp { fsp: s, zoned: sz }, Timestamp { fsp: t, zoned: tz }) => {
            if sz && !tz {
                return Err("time zone offset would be dropped".into());
            }
            if t < s {
                return Err(format!("fractional seconds {} reduced to {}", s, t));
            }
            true
        }
        (Uuid, Uuid) => true,
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(format!("{:?} cannot hold every {:?} value", target, source))
    }
}
