//! The result adaptor handed to completion callbacks.
//!
//! A `Results` is immutable after construction and owned by the callback
//! invocation. Errors ride on the adaptor itself rather than being thrown:
//! check `is_error` before touching cells. Typed getters report conversion
//! problems locally and never touch the request-level error flag.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use crate::error::{Error, Result};
use crate::pg::protocol::{FieldDescription, Format};
use crate::pg::types::Value;

/// Column descriptions shared between incremental deliveries of one request.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// A completed (or failed) reply to one queued request.
#[derive(Debug, Default)]
pub struct Results {
    error: bool,
    error_string: String,
    query: String,
    command_tag: String,
    columns: SharedColumns,
    rows: Vec<Vec<Value>>,
    last_result_set: bool,
}

impl Results {
    /// A connection- or pipeline-level failure for a request that never
    /// produced a reply.
    pub(crate) fn from_error(query: String, error: &Error) -> Self {
        Self {
            error: true,
            error_string: error.to_string(),
            query,
            last_result_set: true,
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    /// The query text this reply answers.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// False while more deliveries for the same request will follow
    /// (single-row mode, multi-statement simple queries).
    pub fn last_result_set(&self) -> bool {
        self.last_result_set
    }

    pub(crate) fn mark_last_result_set(&mut self) {
        self.last_result_set = true;
    }

    /// Number of rows in this delivery.
    pub fn size(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    pub fn fields(&self) -> usize {
        self.columns.len()
    }

    /// Rows affected, parsed from the command tag ("INSERT 0 5" -> 5).
    pub fn num_rows_affected(&self) -> u64 {
        let parts: Vec<&str> = self.command_tag.split_whitespace().collect();
        match parts.as_slice() {
            ["INSERT", _, n] | ["UPDATE", n] | ["DELETE", n] | ["SELECT", n] => {
                n.parse().unwrap_or(0)
            }
            _ => 0,
        }
    }

    pub fn index_of_field(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|f| f.name == name)
    }

    pub fn field_name(&self, column: usize) -> Option<&str> {
        self.columns.get(column).map(|f| f.name.as_str())
    }

    /// Borrow a cell. Out-of-range access is an error value, never a panic.
    pub fn value(&self, row: usize, column: usize) -> Result<&Value> {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .ok_or(Error::OutOfRange {
                row,
                column,
                rows: self.rows.len(),
                columns: self.columns.len(),
            })
    }

    /// Must be consulted before typed getters wherever null is possible:
    /// getters answer type defaults for null cells.
    pub fn is_null(&self, row: usize, column: usize) -> Result<bool> {
        Ok(self.value(row, column)?.is_null())
    }

    pub fn get_bool(&self, row: usize, column: usize) -> Result<bool> {
        self.typed(row, column, false, Value::to_bool)
    }

    pub fn get_i32(&self, row: usize, column: usize) -> Result<i32> {
        self.typed(row, column, 0, Value::to_i32)
    }

    pub fn get_i64(&self, row: usize, column: usize) -> Result<i64> {
        self.typed(row, column, 0, Value::to_i64)
    }

    pub fn get_u64(&self, row: usize, column: usize) -> Result<u64> {
        self.typed(row, column, 0, Value::to_u64)
    }

    pub fn get_f64(&self, row: usize, column: usize) -> Result<f64> {
        self.typed(row, column, 0.0, Value::to_f64)
    }

    pub fn get_text(&self, row: usize, column: usize) -> Result<String> {
        self.typed(row, column, String::new(), Value::to_text)
    }

    pub fn get_bytes(&self, row: usize, column: usize) -> Result<Vec<u8>> {
        self.typed(row, column, Vec::new(), Value::to_bytes)
    }

    pub fn get_date(&self, row: usize, column: usize) -> Result<NaiveDate> {
        self.typed(row, column, NaiveDate::default(), Value::to_date)
    }

    pub fn get_time(&self, row: usize, column: usize) -> Result<NaiveTime> {
        self.typed(row, column, NaiveTime::default(), Value::to_time)
    }

    pub fn get_timestamp(&self, row: usize, column: usize) -> Result<DateTime<Utc>> {
        self.typed(row, column, DateTime::<Utc>::default(), Value::to_timestamp)
    }

    pub fn get_json(&self, row: usize, column: usize) -> Result<serde_json::Value> {
        self.typed(row, column, serde_json::Value::Null, Value::to_json)
    }

    fn typed<T>(
        &self,
        row: usize,
        column: usize,
        null_default: T,
        convert: impl Fn(&Value) -> Result<T>,
    ) -> Result<T> {
        let value = self.value(row, column)?;
        if value.is_null() {
            Ok(null_default)
        } else {
            convert(value)
        }
    }
}

/// Accumulates the wire reply for the head request.
#[derive(Debug, Default)]
pub(crate) struct ResultsBuilder {
    columns: SharedColumns,
    rows: Vec<Vec<Value>>,
    command_tag: String,
}

impl ResultsBuilder {
    pub fn set_columns(&mut self, fields: Vec<FieldDescription>) {
        self.columns = Arc::new(fields);
        self.rows.clear();
    }

    /// Decode one DataRow according to each column's format.
    pub fn push_row(&mut self, values: Vec<Option<Bytes>>) -> Result<()> {
        let mut row = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            let decoded = match value {
                None => Value::Null,
                Some(data) => match self.columns.get(i) {
                    Some(field) if field.format == Format::Binary => {
                        Value::decode_binary(field.type_oid, &data)?
                    }
                    Some(field) => Value::decode_text(field.type_oid, &data)?,
                    None => Value::decode_text(crate::pg::types::Oid::TEXT, &data)?,
                },
            };
            row.push(decoded);
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn set_command_tag(&mut self, tag: String) {
        self.command_tag = tag;
    }

    /// Finish this delivery, leaving the builder ready for a following result
    /// set of the same request.
    pub fn finish(&mut self, query: &str, last_result_set: bool) -> Results {
        Results {
            error: false,
            error_string: String::new(),
            query: query.to_string(),
            command_tag: std::mem::take(&mut self.command_tag),
            columns: Arc::clone(&self.columns),
            rows: std::mem::take(&mut self.rows),
            last_result_set,
        }
    }

    /// Failed delivery carrying the accumulated query's error.
    pub fn finish_error(&mut self, query: &str, error: &Error) -> Results {
        self.rows.clear();
        self.command_tag.clear();
        Results {
            error: true,
            error_string: error.to_string(),
            query: query.to_string(),
            command_tag: String::new(),
            columns: Arc::clone(&self.columns),
            rows: Vec::new(),
            last_result_set: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::types::Oid;

    fn field(name: &str, oid: Oid) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: oid,
            type_size: 0,
            type_modifier: -1,
            format: Format::Binary,
        }
    }

    fn one_cell(value: Value, oid: Oid) -> Results {
        let mut builder = ResultsBuilder::default();
        builder.set_columns(vec![field("c0", oid)]);
        let encoded = Bytes::from(value.encode_binary());
        builder.push_row(vec![Some(encoded)]).unwrap();
        builder.set_command_tag("SELECT 1".to_string());
        builder.finish("SELECT ...", true)
    }

    #[test]
    fn test_typed_access_and_metadata() {
        let results = one_cell(Value::Int8(42), Oid::INT8);
        assert!(!results.is_error());
        assert_eq!(results.size(), 1);
        assert_eq!(results.fields(), 1);
        assert_eq!(results.get_i64(0, 0).unwrap(), 42);
        assert_eq!(results.get_u64(0, 0).unwrap(), 42);
        assert_eq!(results.index_of_field("c0"), Some(0));
        assert_eq!(results.index_of_field("missing"), None);
        assert_eq!(results.field_name(0), Some("c0"));
        assert_eq!(results.num_rows_affected(), 1);
    }

    #[test]
    fn test_out_of_range_is_an_error_value() {
        let results = one_cell(Value::Int4(1), Oid::INT4);
        assert!(matches!(
            results.get_i32(1, 0),
            Err(Error::OutOfRange { row: 1, .. })
        ));
        assert!(matches!(
            results.get_i32(0, 3),
            Err(Error::OutOfRange { column: 3, .. })
        ));
        assert!(results.is_null(5, 5).is_err());
    }

    #[test]
    fn test_null_cells_answer_defaults_behind_is_null() {
        let mut builder = ResultsBuilder::default();
        builder.set_columns(vec![field("n", Oid::INT4)]);
        builder.push_row(vec![None]).unwrap();
        let results = builder.finish("SELECT NULL", true);

        assert!(results.is_null(0, 0).unwrap());
        assert_eq!(results.get_i32(0, 0).unwrap(), 0);
        assert_eq!(results.get_text(0, 0).unwrap(), "");
    }

    #[test]
    fn test_conversion_error_does_not_flip_request_error() {
        let results = one_cell(Value::Text("abc".to_string()), Oid::TEXT);
        assert!(results.get_i64(0, 0).is_err());
        assert!(!results.is_error());
    }

    #[test]
    fn test_rows_affected_parsing() {
        let mut builder = ResultsBuilder::default();
        builder.set_command_tag("INSERT 0 5".to_string());
        let results = builder.finish("INSERT ...", true);
        assert_eq!(results.num_rows_affected(), 5);

        let mut builder = ResultsBuilder::default();
        builder.set_command_tag("UPDATE 3".to_string());
        assert_eq!(builder.finish("UPDATE ...", true).num_rows_affected(), 3);
    }

    #[test]
    fn test_error_results_carry_message() {
        let results =
            Results::from_error("SELECT 1".to_string(), &Error::Driven("gone".to_string()));
        assert!(results.is_error());
        assert!(!results.error_string().is_empty());
        assert_eq!(results.size(), 0);
        assert!(results.last_result_set());
    }
}
