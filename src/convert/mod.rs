//! Converting typed records into output rows.
//!
//! A [`RecordConverter`] turns one record into one row of the target
//! file. The tabular converter flattens nested records and pins a
//! column set; the hierarchical converter writes JSON-Lines. Both are
//! selected by short name through [`converter_registry`].

mod csv;
mod json;

use std::io::Read;
use std::sync::Arc;

use apache_avro::types::Value;

use crate::compression::RowSink;
use crate::registry::Registry;
use crate::Result;

pub use self::csv::CsvConverterFactory;
pub use self::json::JsonConverterFactory;

/// Writes typed records as rows of one output file.
pub trait RecordConverter: Send {
    /// Writes one record. Returns `false` without emitting anything
    /// when the record's shape is incompatible with the pinned schema;
    /// the caller then retries against a suffixed sidecar file.
    fn write_record(&mut self, record: &Value) -> Result<bool>;

    /// Flushes buffered rows. Safe to call with no pending write.
    fn flush(&mut self) -> Result<()>;

    /// Flushes, then finishes and releases the underlying stream.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Creates converters and knows the row format's file extension.
pub trait ConverterFactory: Send + Sync {
    /// File extension including the dot, e.g. `.csv`.
    fn extension(&self) -> &'static str;

    /// Reads the pinned header from an existing file's decompressed
    /// content, for formats that pin one.
    fn read_header(&self, reader: Box<dyn Read + Send>) -> Result<Option<Vec<String>>>;

    /// Opens a converter over a row sink. `header` pins the column
    /// set read back from an existing target; `write_header` is set
    /// when the target is new or empty.
    fn converter(
        &self,
        sink: Box<dyn RowSink>,
        header: Option<Vec<String>>,
        write_header: bool,
    ) -> Result<Box<dyn RecordConverter>>;
}

/// Registry with the `csv` and `json` factories pre-registered.
pub fn converter_registry() -> Registry<dyn ConverterFactory> {
    let mut registry = Registry::new("format");
    registry.register(
        "csv",
        Arc::new(CsvConverterFactory) as Arc<dyn ConverterFactory>,
    );
    registry.register(
        "json",
        Arc::new(JsonConverterFactory) as Arc<dyn ConverterFactory>,
    );
    registry
}

/// Looks up a field of a record value by name, resolving unions to
/// their active branch.
pub(crate) fn record_field<'a>(record: &'a Value, name: &str) -> Option<&'a Value> {
    match unwrap_union(record) {
        Value::Record(fields) => fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| unwrap_union(value)),
        _ => None,
    }
}

/// Resolves a union to its active branch; other values pass through.
pub(crate) fn unwrap_union(value: &Value) -> &Value {
    match value {
        Value::Union(_, inner) => unwrap_union(inner),
        other => other,
    }
}
