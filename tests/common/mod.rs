//! Container-file fixtures shared by the integration suites.
#![allow(dead_code)]

use std::fs;
use std::path::Path;

use apache_avro::types::Value;
use apache_avro::{Schema, Writer};

/// Schema of a regular stream envelope: identity key, timed value.
pub const TIMED_SCHEMA: &str = r#"{
  "type": "record", "name": "Envelope", "fields": [
    {"name": "key", "type": {"type": "record", "name": "ObservationKey", "fields": [
      {"name": "projectId", "type": "string"},
      {"name": "userId", "type": "string"},
      {"name": "sourceId", "type": "string"}]}},
    {"name": "value", "type": {"type": "record", "name": "Body", "fields": [
      {"name": "time", "type": "double"},
      {"name": "x", "type": "string"}]}}]}"#;

/// Same envelope with an extra value column, for schema-drift cases.
pub const DRIFTED_SCHEMA: &str = r#"{
  "type": "record", "name": "Envelope", "fields": [
    {"name": "key", "type": {"type": "record", "name": "ObservationKey", "fields": [
      {"name": "projectId", "type": "string"},
      {"name": "userId", "type": "string"},
      {"name": "sourceId", "type": "string"}]}},
    {"name": "value", "type": {"type": "record", "name": "Body", "fields": [
      {"name": "time", "type": "double"},
      {"name": "x", "type": "string"},
      {"name": "y", "type": "string"}]}}]}"#;

/// Windowed-aggregate envelope: key carries the window start millis,
/// the value has no time field.
pub const WINDOWED_SCHEMA: &str = r#"{
  "type": "record", "name": "Envelope", "fields": [
    {"name": "key", "type": {"type": "record", "name": "WindowKey", "fields": [
      {"name": "projectId", "type": "string"},
      {"name": "userId", "type": "string"},
      {"name": "start", "type": "long"}]}},
    {"name": "value", "type": {"type": "record", "name": "Body", "fields": [
      {"name": "x", "type": "string"}]}}]}"#;

/// Envelope with no timestamp anywhere.
pub const TIMELESS_SCHEMA: &str = r#"{
  "type": "record", "name": "Envelope", "fields": [
    {"name": "key", "type": {"type": "record", "name": "ObservationKey", "fields": [
      {"name": "projectId", "type": "string"},
      {"name": "userId", "type": "string"},
      {"name": "sourceId", "type": "string"}]}},
    {"name": "value", "type": {"type": "record", "name": "Body", "fields": [
      {"name": "x", "type": "string"}]}}]}"#;

/// Epoch seconds of Tue 2017-05-02 07:46:15 UTC.
pub const TUESDAY_MORNING: f64 = 1_493_711_175.0;

fn string_fields(fields: &[(&str, Value)]) -> Value {
    Value::Record(
        fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect(),
    )
}

/// A timed envelope record.
pub fn timed_record(project: &str, user: &str, source: &str, time: f64, x: &str) -> Value {
    string_fields(&[
        (
            "key",
            string_fields(&[
                ("projectId", Value::String(project.into())),
                ("userId", Value::String(user.into())),
                ("sourceId", Value::String(source.into())),
            ]),
        ),
        (
            "value",
            string_fields(&[
                ("time", Value::Double(time)),
                ("x", Value::String(x.into())),
            ]),
        ),
    ])
}

/// A timed envelope record with the drifted extra column.
pub fn drifted_record(project: &str, user: &str, source: &str, time: f64, x: &str, y: &str) -> Value {
    string_fields(&[
        (
            "key",
            string_fields(&[
                ("projectId", Value::String(project.into())),
                ("userId", Value::String(user.into())),
                ("sourceId", Value::String(source.into())),
            ]),
        ),
        (
            "value",
            string_fields(&[
                ("time", Value::Double(time)),
                ("x", Value::String(x.into())),
                ("y", Value::String(y.into())),
            ]),
        ),
    ])
}

/// A windowed envelope record keyed by window start millis.
pub fn windowed_record(project: &str, user: &str, start_millis: i64, x: &str) -> Value {
    string_fields(&[
        (
            "key",
            string_fields(&[
                ("projectId", Value::String(project.into())),
                ("userId", Value::String(user.into())),
                ("start", Value::Long(start_millis)),
            ]),
        ),
        ("value", string_fields(&[("x", Value::String(x.into()))])),
    ])
}

/// An envelope record carrying no timestamp at all.
pub fn timeless_record(project: &str, user: &str, source: &str, x: &str) -> Value {
    string_fields(&[
        (
            "key",
            string_fields(&[
                ("projectId", Value::String(project.into())),
                ("userId", Value::String(user.into())),
                ("sourceId", Value::String(source.into())),
            ]),
        ),
        ("value", string_fields(&[("x", Value::String(x.into()))])),
    ])
}

/// Writes a container file with the given schema and records.
pub fn write_container(path: &Path, schema: &str, records: &[Value]) {
    let schema = Schema::parse_str(schema).expect("fixture schema parses");
    let mut writer = Writer::new(&schema, Vec::new());
    for record in records {
        writer.append(record.clone()).expect("fixture record resolves");
    }
    let bytes = writer.into_inner().expect("fixture container finishes");
    fs::create_dir_all(path.parent().expect("fixture path has a parent")).unwrap();
    fs::write(path, bytes).unwrap();
}
