use std::io::{Read, Write};

use apache_avro::types::Value;
use serde_json::{json, Map, Number};

use super::{ConverterFactory, RecordConverter};
use crate::compression::RowSink;
use crate::{RestructureError, Result};

/// Factory for the hierarchical JSON-Lines converter.
pub struct JsonConverterFactory;

impl ConverterFactory for JsonConverterFactory {
    fn extension(&self) -> &'static str {
        ".json"
    }

    fn read_header(&self, _reader: Box<dyn Read + Send>) -> Result<Option<Vec<String>>> {
        // JSON-Lines has no pinned schema.
        Ok(None)
    }

    fn converter(
        &self,
        sink: Box<dyn RowSink>,
        _header: Option<Vec<String>>,
        _write_header: bool,
    ) -> Result<Box<dyn RecordConverter>> {
        Ok(Box::new(JsonRecordConverter { sink }))
    }
}

/// Writes one JSON document per record, preserving the hierarchy.
/// Accepts every record shape, so it never refuses a write.
struct JsonRecordConverter {
    sink: Box<dyn RowSink>,
}

impl RecordConverter for JsonRecordConverter {
    fn write_record(&mut self, record: &Value) -> Result<bool> {
        let document = to_json(record)?;
        serde_json::to_writer(&mut self.sink, &document)?;
        self.sink.write_all(b"\n")?;
        Ok(true)
    }

    fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.sink.finish()
    }
}

/// Maps a typed record value onto JSON: unions resolve to the active
/// branch, bytes and fixed values encode as base64 strings.
fn to_json(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(v) => json!(v),
        Value::Int(v) => json!(v),
        Value::Long(v) => json!(v),
        Value::Date(v) => json!(v),
        Value::TimeMillis(v) => json!(v),
        Value::TimeMicros(v) => json!(v),
        Value::TimestampMillis(v) => json!(v),
        Value::TimestampMicros(v) => json!(v),
        Value::Float(v) => float_json(f64::from(*v)),
        Value::Double(v) => float_json(*v),
        Value::String(v) => json!(v),
        Value::Enum(_, symbol) => json!(symbol),
        Value::Bytes(bytes) | Value::Fixed(_, bytes) => json!(base64::encode(bytes)),
        Value::Uuid(v) => json!(v.to_string()),
        Value::Union(_, inner) => to_json(inner)?,
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(to_json).collect::<Result<_>>()?)
        }
        Value::Map(entries) => {
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort_unstable();
            let mut object = Map::new();
            for key in keys {
                object.insert(key.clone(), to_json(&entries[key])?);
            }
            serde_json::Value::Object(object)
        }
        Value::Record(fields) => {
            let mut object = Map::new();
            for (name, field) in fields {
                object.insert(name.clone(), to_json(field)?);
            }
            serde_json::Value::Object(object)
        }
        other => {
            return Err(RestructureError::RecordMapping(format!(
                "cannot map value {other:?} to JSON"
            )))
        }
    })
}

fn float_json(v: f64) -> serde_json::Value {
    Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionCodec, IdentityCodec};
    use std::fs::{self, File};

    #[test]
    fn writes_one_document_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let sink = IdentityCodec
            .writer(File::create(&path).unwrap(), None, "out.json")
            .unwrap();
        let mut converter = JsonConverterFactory.converter(sink, None, true).unwrap();

        let first = Value::Record(vec![
            ("key".into(), Value::Null),
            (
                "value".into(),
                Value::Record(vec![("time".into(), Value::Double(1.5))]),
            ),
        ]);
        let second = Value::Record(vec![("other".into(), Value::String("shape".into()))]);
        assert!(converter.write_record(&first).unwrap());
        assert!(converter.write_record(&second).unwrap(), "never refuses");
        converter.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "{\"key\":null,\"value\":{\"time\":1.5}}\n{\"other\":\"shape\"}\n"
        );
    }

    #[test]
    fn bytes_encode_as_base64() {
        let value = Value::Record(vec![("raw".into(), Value::Bytes(vec![0xde, 0xad]))]);
        let document = to_json(&value).unwrap();
        assert_eq!(document["raw"], json!(base64::encode([0xde, 0xad])));
    }

    #[test]
    fn unions_resolve_to_active_branch() {
        let value = Value::Union(1, Box::new(Value::Long(42)));
        assert_eq!(to_json(&value).unwrap(), json!(42));
    }
}
