//! PostgreSQL type encoding and decoding.
//!
//! Binary-format codecs for the types the driver materializes, plus the
//! conversion views the result adaptor exposes. Temporal values are carried
//! as `chrono` types and structured values as `serde_json::Value`; on the
//! wire both follow the server's binary formats (microseconds/days since the
//! 2000-01-01 epoch, JSONB version byte).

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Microseconds between the Unix epoch and 2000-01-01T00:00:00Z.
const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).expect("valid constant date")
}

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL built-in type object identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const TIMETZ: Oid = Oid(1266);
    pub const UUID: Oid = Oid(2950);
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);
    pub const NUMERIC: Oid = Oid(1700);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }
}

// ============================================================================
// Values
// ============================================================================

/// A typed cell or parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    /// Types without a dedicated codec keep their raw wire bytes.
    Raw { oid: Oid, data: Vec<u8> },
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the stored class, for conversion error messages.
    pub fn storage_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int2(_) => "int2",
            Value::Int4(_) => "int4",
            Value::Int8(_) => "int8",
            Value::Float4(_) => "float4",
            Value::Float8(_) => "float8",
            Value::Text(_) => "text",
            Value::Bytea(_) => "bytea",
            Value::Uuid(_) => "uuid",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Timestamp(_) => "timestamptz",
            Value::Json(_) => "json",
            Value::Raw { .. } => "raw",
        }
    }

    /// The OID used when this value is bound as a parameter.
    pub fn type_oid(&self) -> Oid {
        match self {
            Value::Null => Oid::TEXT,
            Value::Bool(_) => Oid::BOOL,
            Value::Int2(_) => Oid::INT2,
            Value::Int4(_) => Oid::INT4,
            Value::Int8(_) => Oid::INT8,
            Value::Float4(_) => Oid::FLOAT4,
            Value::Float8(_) => Oid::FLOAT8,
            Value::Text(_) => Oid::TEXT,
            Value::Bytea(_) => Oid::BYTEA,
            Value::Uuid(_) => Oid::UUID,
            Value::Date(_) => Oid::DATE,
            Value::Time(_) => Oid::TIME,
            Value::Timestamp(_) => Oid::TIMESTAMPTZ,
            Value::Json(_) => Oid::JSONB,
            Value::Raw { oid, .. } => *oid,
        }
    }

    /// Encode to the server's binary parameter format.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            Value::Null => vec![],
            Value::Bool(v) => vec![u8::from(*v)],
            Value::Int2(v) => v.to_be_bytes().to_vec(),
            Value::Int4(v) => v.to_be_bytes().to_vec(),
            Value::Int8(v) => v.to_be_bytes().to_vec(),
            Value::Float4(v) => v.to_be_bytes().to_vec(),
            Value::Float8(v) => v.to_be_bytes().to_vec(),
            Value::Text(v) => v.as_bytes().to_vec(),
            Value::Bytea(v) => v.clone(),
            Value::Uuid(v) => v.as_bytes().to_vec(),
            Value::Date(v) => {
                let days = (*v - pg_epoch_date()).num_days() as i32;
                days.to_be_bytes().to_vec()
            }
            Value::Time(v) => {
                let micros = v.num_seconds_from_midnight() as i64 * 1_000_000
                    + (v.nanosecond() / 1_000) as i64;
                micros.to_be_bytes().to_vec()
            }
            Value::Timestamp(v) => {
                let micros = v.timestamp_micros() - PG_EPOCH_MICROS;
                micros.to_be_bytes().to_vec()
            }
            Value::Json(v) => {
                // JSONB binary format carries a leading version byte.
                let mut out = vec![1u8];
                out.extend_from_slice(v.to_string().as_bytes());
                out
            }
            Value::Raw { data, .. } => data.clone(),
        }
    }

    /// Decode from the server's binary result format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> Result<Self> {
        match oid {
            Oid::BOOL => match data {
                [b] => Ok(Value::Bool(*b != 0)),
                _ => Err(type_error("BOOL", data.len())),
            },
            Oid::INT2 => Ok(Value::Int2(i16::from_be_bytes(fixed(data, "INT2")?))),
            Oid::INT4 => Ok(Value::Int4(i32::from_be_bytes(fixed(data, "INT4")?))),
            Oid::INT8 => Ok(Value::Int8(i64::from_be_bytes(fixed(data, "INT8")?))),
            Oid::FLOAT4 => Ok(Value::Float4(f32::from_be_bytes(fixed(data, "FLOAT4")?))),
            Oid::FLOAT8 => Ok(Value::Float8(f64::from_be_bytes(fixed(data, "FLOAT8")?))),
            Oid::BYTEA => Ok(Value::Bytea(data.to_vec())),
            Oid::UUID => {
                let bytes: [u8; 16] = fixed(data, "UUID")?;
                Ok(Value::Uuid(Uuid::from_bytes(bytes)))
            }
            Oid::DATE => {
                let days = i32::from_be_bytes(fixed(data, "DATE")?);
                pg_epoch_date()
                    .checked_add_signed(TimeDelta::days(days as i64))
                    .map(Value::Date)
                    .ok_or_else(|| Error::Protocol(format!("date out of range: {}", days)))
            }
            Oid::TIME | Oid::TIMETZ => {
                let micros = i64::from_be_bytes(fixed(&data[..8.min(data.len())], "TIME")?);
                let secs = (micros / 1_000_000) as u32;
                let nanos = ((micros % 1_000_000) * 1_000) as u32;
                NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                    .map(Value::Time)
                    .ok_or_else(|| Error::Protocol(format!("time out of range: {}", micros)))
            }
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => {
                let micros = i64::from_be_bytes(fixed(data, "TIMESTAMP")?);
                DateTime::<Utc>::from_timestamp_micros(micros + PG_EPOCH_MICROS)
                    .map(Value::Timestamp)
                    .ok_or_else(|| Error::Protocol(format!("timestamp out of range: {}", micros)))
            }
            Oid::JSON | Oid::JSONB => {
                let json_data = if oid == Oid::JSONB && !data.is_empty() {
                    &data[1..]
                } else {
                    data
                };
                serde_json::from_slice(json_data)
                    .map(Value::Json)
                    .map_err(|e| Error::Protocol(format!("invalid json payload: {}", e)))
            }
            _ if oid.is_text_like() => match std::str::from_utf8(data) {
                Ok(s) => Ok(Value::Text(s.to_owned())),
                Err(_) => Err(Error::Protocol("invalid UTF-8 in text value".to_string())),
            },
            _ => Ok(Value::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format, used for simple-protocol result sets.
    pub fn decode_text(oid: Oid, data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(data).into_owned();
        match oid {
            Oid::BOOL => Ok(Value::Bool(matches!(text.as_str(), "t" | "true" | "1"))),
            Oid::INT2 => parse_num(&text, "INT2").map(Value::Int2),
            Oid::INT4 => parse_num(&text, "INT4").map(Value::Int4),
            Oid::INT8 => parse_num(&text, "INT8").map(Value::Int8),
            Oid::FLOAT4 => parse_num(&text, "FLOAT4").map(Value::Float4),
            Oid::FLOAT8 => parse_num(&text, "FLOAT8").map(Value::Float8),
            Oid::UUID => text
                .parse::<Uuid>()
                .map(Value::Uuid)
                .map_err(|_| Error::Protocol(format!("invalid uuid: {}", text))),
            Oid::DATE => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| Error::Protocol(format!("invalid date: {}", text))),
            Oid::TIME => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
                .map(Value::Time)
                .map_err(|_| Error::Protocol(format!("invalid time: {}", text))),
            Oid::TIMESTAMPTZ | Oid::TIMESTAMP => parse_timestamp_text(&text),
            Oid::JSON | Oid::JSONB => serde_json::from_str(&text)
                .map(Value::Json)
                .map_err(|_| Error::Protocol(format!("invalid json: {}", text))),
            _ => Ok(Value::Text(text)),
        }
    }

    // ------------------------------------------------------------------
    // Conversion views, used by the result adaptor. Null never reaches
    // these; the adaptor answers defaults for null cells.
    // ------------------------------------------------------------------

    pub(crate) fn to_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => Err(conversion(other, "bool")),
        }
    }

    pub(crate) fn to_i32(&self) -> Result<i32> {
        match self {
            Value::Int2(v) => Ok(*v as i32),
            Value::Int4(v) => Ok(*v),
            Value::Int8(v) => i32::try_from(*v).map_err(|_| conversion(self, "i32")),
            other => Err(conversion(other, "i32")),
        }
    }

    pub(crate) fn to_i64(&self) -> Result<i64> {
        match self {
            Value::Int2(v) => Ok(*v as i64),
            Value::Int4(v) => Ok(*v as i64),
            Value::Int8(v) => Ok(*v),
            other => Err(conversion(other, "i64")),
        }
    }

    pub(crate) fn to_u64(&self) -> Result<u64> {
        match self {
            Value::Int2(v) => u64::try_from(*v).map_err(|_| conversion(self, "u64")),
            Value::Int4(v) => u64::try_from(*v).map_err(|_| conversion(self, "u64")),
            Value::Int8(v) => u64::try_from(*v).map_err(|_| conversion(self, "u64")),
            // Values bound from u64 above i64::MAX travel as decimal text.
            Value::Text(v) => v.parse::<u64>().map_err(|_| conversion(self, "u64")),
            other => Err(conversion(other, "u64")),
        }
    }

    pub(crate) fn to_f64(&self) -> Result<f64> {
        match self {
            Value::Float4(v) => Ok(*v as f64),
            Value::Float8(v) => Ok(*v),
            Value::Int2(v) => Ok(*v as f64),
            Value::Int4(v) => Ok(*v as f64),
            other => Err(conversion(other, "f64")),
        }
    }

    pub(crate) fn to_text(&self) -> Result<String> {
        match self {
            Value::Text(v) => Ok(v.clone()),
            other => Err(conversion(other, "text")),
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Value::Bytea(v) => Ok(v.clone()),
            Value::Text(v) => Ok(v.as_bytes().to_vec()),
            Value::Raw { data, .. } => Ok(data.clone()),
            other => Err(conversion(other, "bytes")),
        }
    }

    pub(crate) fn to_date(&self) -> Result<NaiveDate> {
        match self {
            Value::Date(v) => Ok(*v),
            Value::Timestamp(v) => Ok(v.date_naive()),
            other => Err(conversion(other, "date")),
        }
    }

    pub(crate) fn to_time(&self) -> Result<NaiveTime> {
        match self {
            Value::Time(v) => Ok(*v),
            Value::Timestamp(v) => Ok(v.time()),
            other => Err(conversion(other, "time")),
        }
    }

    pub(crate) fn to_timestamp(&self) -> Result<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Ok(*v),
            other => Err(conversion(other, "timestamp")),
        }
    }

    pub(crate) fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            Value::Json(v) => Ok(v.clone()),
            other => Err(conversion(other, "json")),
        }
    }
}

fn conversion(value: &Value, to: &'static str) -> Error {
    Error::Conversion {
        from: value.storage_name(),
        to,
    }
}

fn type_error(kind: &str, len: usize) -> Error {
    Error::Protocol(format!("invalid {} length: {}", kind, len))
}

fn fixed<const N: usize>(data: &[u8], kind: &str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| type_error(kind, data.len()))
}

fn parse_num<T: std::str::FromStr>(text: &str, kind: &'static str) -> Result<T> {
    text.parse::<T>()
        .map_err(|_| Error::Protocol(format!("invalid {}: {}", kind, text)))
}

fn parse_timestamp_text(text: &str) -> Result<Value> {
    DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|dt| Value::Timestamp(dt.with_timezone(&Utc)))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map(|dt| Value::Timestamp(dt.and_utc()))
        })
        .map_err(|_| Error::Protocol(format!("invalid timestamp: {}", text)))
}

// ============================================================================
// Ergonomic parameter construction
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int2(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int4(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int8(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        // No unsigned wire type; large values travel as decimal text and are
        // cast server-side.
        match i64::try_from(v) {
            Ok(signed) => Value::Int8(signed),
            Err(_) => Value::Text(v.to_string()),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float8(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytea(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Value::Time(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int8_roundtrip() {
        let original = Value::Int8(42);
        let decoded = Value::decode_binary(Oid::INT8, &original.encode_binary()).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(decoded.to_i64().unwrap(), 42);
        assert_eq!(decoded.to_u64().unwrap(), 42);
    }

    #[test]
    fn test_date_epoch_offsets() {
        let date = NaiveDate::from_ymd_opt(2000, 1, 2).unwrap();
        let encoded = Value::Date(date).encode_binary();
        assert_eq!(encoded, 1i32.to_be_bytes());
        assert_eq!(
            Value::decode_binary(Oid::DATE, &encoded).unwrap(),
            Value::Date(date)
        );

        let before_epoch = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
        let encoded = Value::Date(before_epoch).encode_binary();
        assert_eq!(encoded, (-1i32).to_be_bytes());
    }

    #[test]
    fn test_timestamp_roundtrip_microsecond_exact() {
        let ts = DateTime::<Utc>::from_timestamp_micros(1_700_000_123_456_789).unwrap();
        let encoded = Value::Timestamp(ts).encode_binary();
        assert_eq!(
            Value::decode_binary(Oid::TIMESTAMPTZ, &encoded).unwrap(),
            Value::Timestamp(ts)
        );
    }

    #[test]
    fn test_jsonb_version_byte() {
        let json: serde_json::Value = serde_json::json!({"a": [1, 2]});
        let encoded = Value::Json(json.clone()).encode_binary();
        assert_eq!(encoded[0], 1);
        assert_eq!(
            Value::decode_binary(Oid::JSONB, &encoded).unwrap(),
            Value::Json(json)
        );
    }

    #[test]
    fn test_u64_above_i64_travels_as_text() {
        let big = u64::MAX - 1;
        let value = Value::from(big);
        assert_eq!(value, Value::Text(big.to_string()));
        assert_eq!(value.to_u64().unwrap(), big);
    }

    #[test]
    fn test_conversion_error_names_classes() {
        let err = Value::Text("x".to_string()).to_i64().unwrap_err();
        match err {
            Error::Conversion { from, to } => {
                assert_eq!(from, "text");
                assert_eq!(to, "i64");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_narrowing_overflow_is_an_error() {
        assert!(Value::Int8(i64::MAX).to_i32().is_err());
        assert!(Value::Int4(-1).to_u64().is_err());
    }

    #[test]
    fn test_text_decode_paths() {
        assert_eq!(
            Value::decode_text(Oid::BOOL, b"t").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            Value::decode_text(Oid::INT4, b"-7").unwrap(),
            Value::Int4(-7)
        );
        assert_eq!(
            Value::decode_text(Oid::DATE, b"2024-02-29").unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
    }
}
