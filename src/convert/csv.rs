use std::io::Read;

use apache_avro::types::Value;

use super::{ConverterFactory, RecordConverter};
use crate::compression::RowSink;
use crate::{RestructureError, Result};

/// Factory for the flattened tabular converter.
pub struct CsvConverterFactory;

impl ConverterFactory for CsvConverterFactory {
    fn extension(&self) -> &'static str {
        ".csv"
    }

    fn read_header(&self, reader: Box<dyn Read + Send>) -> Result<Option<Vec<String>>> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);
        match csv_reader.headers() {
            Ok(headers) if !headers.is_empty() => {
                Ok(Some(headers.iter().map(str::to_string).collect()))
            }
            _ => Ok(None),
        }
    }

    fn converter(
        &self,
        sink: Box<dyn RowSink>,
        header: Option<Vec<String>>,
        write_header: bool,
    ) -> Result<Box<dyn RecordConverter>> {
        Ok(Box::new(CsvRecordConverter {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(sink),
            header,
            write_header,
        }))
    }
}

/// Flattens hierarchical records into rows of one CSV file.
///
/// The first record written pins the column list and order; when the
/// target already existed the pin comes from its header row instead.
/// Records exposing a different column set are refused with `false` so
/// the caller can spill them to a suffixed sidecar file.
struct CsvRecordConverter {
    writer: csv::Writer<Box<dyn RowSink>>,
    header: Option<Vec<String>>,
    write_header: bool,
}

impl RecordConverter for CsvRecordConverter {
    fn write_record(&mut self, record: &Value) -> Result<bool> {
        let row = flatten(record)?;
        let names: Vec<&str> = row.iter().map(|(name, _)| name.as_str()).collect();

        match &self.header {
            Some(pinned) => {
                if pinned.len() != names.len()
                    || pinned.iter().zip(&names).any(|(p, n)| p != n)
                {
                    return Ok(false);
                }
            }
            None => {
                let pinned: Vec<String> = names.iter().map(|n| n.to_string()).collect();
                if self.write_header {
                    self.writer.write_record(&pinned)?;
                    self.write_header = false;
                }
                self.header = Some(pinned);
            }
        }

        let mut out = csv::ByteRecord::new();
        for (_, cell) in &row {
            out.push_field(cell);
        }
        self.writer.write_byte_record(&out)?;
        Ok(true)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let sink = self
            .writer
            .into_inner()
            .map_err(|e| RestructureError::StringError(e.to_string()))?;
        sink.finish()
    }
}

/// Flattens a record into `(column, cell)` pairs: nested field names
/// dot-joined, arrays by index, maps by key, unions resolved to the
/// active branch. Bytes and fixed values stay raw.
fn flatten(record: &Value) -> Result<Vec<(String, Vec<u8>)>> {
    let mut row = Vec::new();
    match record {
        Value::Record(_) | Value::Union(_, _) => flatten_into(String::new(), record, &mut row)?,
        other => {
            return Err(RestructureError::RecordMapping(format!(
                "top-level value must be a record, got {other:?}"
            )))
        }
    }
    Ok(row)
}

fn flatten_into(prefix: String, value: &Value, row: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
    let joined = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };
    match value {
        Value::Record(fields) => {
            for (name, field) in fields {
                flatten_into(joined(name), field, row)?;
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_into(joined(&index.to_string()), item, row)?;
            }
        }
        Value::Map(entries) => {
            // Stable column order for an unordered map.
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort_unstable();
            for key in keys {
                flatten_into(joined(key), &entries[key], row)?;
            }
        }
        Value::Union(_, inner) => flatten_into(prefix, inner, row)?,
        scalar => row.push((prefix, scalar_cell(scalar)?)),
    }
    Ok(())
}

fn scalar_cell(value: &Value) -> Result<Vec<u8>> {
    Ok(match value {
        Value::Null => Vec::new(),
        Value::Boolean(v) => v.to_string().into_bytes(),
        Value::Int(v) => v.to_string().into_bytes(),
        Value::Long(v) => v.to_string().into_bytes(),
        Value::Float(v) => v.to_string().into_bytes(),
        Value::Double(v) => v.to_string().into_bytes(),
        Value::Date(v) => v.to_string().into_bytes(),
        Value::TimeMillis(v) => v.to_string().into_bytes(),
        Value::TimeMicros(v) => v.to_string().into_bytes(),
        Value::TimestampMillis(v) => v.to_string().into_bytes(),
        Value::TimestampMicros(v) => v.to_string().into_bytes(),
        Value::String(v) => v.clone().into_bytes(),
        Value::Enum(_, symbol) => symbol.clone().into_bytes(),
        Value::Bytes(bytes) => bytes.clone(),
        Value::Fixed(_, bytes) => bytes.clone(),
        Value::Uuid(v) => v.to_string().into_bytes(),
        other => {
            return Err(RestructureError::RecordMapping(format!(
                "cannot map value {other:?} to a cell"
            )))
        }
    })
}
