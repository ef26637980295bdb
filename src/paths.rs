use std::path::PathBuf;
use std::str::FromStr;

use apache_avro::types::Value;
use chrono::{DateTime, TimeZone, Utc};

use crate::convert::record_field;
use crate::{RestructureError, Result};

/// Bin name for records with no usable timestamp.
const UNKNOWN_DATE_BIN: &str = "unknown_date";

/// UTC time window used as the leaf file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeBinFormat {
    /// One file per hour: `YYYYMMDD_HH00`.
    #[default]
    Hourly,
    /// One file per month: `YYYYMM`.
    Monthly,
}

impl TimeBinFormat {
    /// Formats a record instant into its bin name.
    pub fn bin(&self, time: Option<DateTime<Utc>>) -> String {
        let Some(time) = time else {
            return UNKNOWN_DATE_BIN.to_string();
        };
        match self {
            TimeBinFormat::Hourly => time.format("%Y%m%d_%H00").to_string(),
            TimeBinFormat::Monthly => time.format("%Y%m").to_string(),
        }
    }
}

impl FromStr for TimeBinFormat {
    type Err = RestructureError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hourly" => Ok(TimeBinFormat::Hourly),
            "monthly" => Ok(TimeBinFormat::Monthly),
            other => Err(RestructureError::Config(format!(
                "unknown time bin format {other:?}, expected hourly or monthly"
            ))),
        }
    }
}

/// Where one record belongs in the output tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOrganization {
    /// Full target path under the output root.
    pub path: PathBuf,
    /// Sanitized source category for bin accounting.
    pub category: String,
    /// The record instant, when one could be derived.
    pub time: Option<DateTime<Utc>>,
}

/// Maps `(topic, key, value, attempt)` to a target path.
///
/// The record instant comes from the value's `time` field (floating
/// seconds since epoch) or, for windowed aggregates, the key's `start`
/// field (integer millis); records with neither land in the
/// `unknown_date` bin. Identities are sanitized to `[A-Za-z0-9_-]`.
pub struct RecordPathFactory {
    root: PathBuf,
    bin_format: TimeBinFormat,
    extension: String,
}

impl RecordPathFactory {
    /// Creates a factory writing under `root` with the full file
    /// extension (row format plus compression, e.g. `.csv.gz`).
    pub fn new(root: impl Into<PathBuf>, bin_format: TimeBinFormat, extension: String) -> Self {
        Self {
            root: root.into(),
            bin_format,
            extension,
        }
    }

    /// Computes the target organization of one record.
    pub fn organize(
        &self,
        topic: &str,
        key: &Value,
        value: &Value,
        attempt: u32,
    ) -> RecordOrganization {
        let time = record_time(key, value);
        let project = sanitize_identifier(record_field(key, "projectId"), "unknown-project");
        let user = sanitize_identifier(record_field(key, "userId"), "unknown-user");
        let category = sanitize_identifier(record_field(key, "sourceId"), "unknown-source");

        let suffix = if attempt == 0 {
            String::new()
        } else {
            format!("_{attempt}")
        };
        let file_name = format!("{}{suffix}{}", self.bin_format.bin(time), self.extension);
        let path = self
            .root
            .join(project)
            .join(user)
            .join(topic)
            .join(file_name);

        RecordOrganization {
            path,
            category,
            time,
        }
    }

    /// The bin name a record instant falls into.
    pub fn time_bin(&self, time: Option<DateTime<Utc>>) -> String {
        self.bin_format.bin(time)
    }
}

/// Derives the record instant: value `time` in floating seconds wins,
/// then key `start` in integer millis, else none.
fn record_time(key: &Value, value: &Value) -> Option<DateTime<Utc>> {
    if let Some(seconds) = numeric_seconds(record_field(value, "time")) {
        let millis = (seconds * 1000.0).round() as i64;
        return Utc.timestamp_millis_opt(millis).single();
    }
    if let Some(millis) = integer_millis(record_field(key, "start")) {
        return Utc.timestamp_millis_opt(millis).single();
    }
    None
}

fn numeric_seconds(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Double(v) => Some(*v),
        Value::Float(v) => Some(f64::from(*v)),
        Value::Long(v) => Some(*v as f64),
        Value::Int(v) => Some(f64::from(*v)),
        _ => None,
    }
}

fn integer_millis(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Long(v) => Some(*v),
        Value::Int(v) => Some(i64::from(*v)),
        Value::TimestampMillis(v) => Some(*v),
        _ => None,
    }
}

/// Strips every character outside `[A-Za-z0-9_-]` from a string value;
/// empty or missing values fall back to the given default.
fn sanitize_identifier(value: Option<&Value>, fallback: &str) -> String {
    let raw = match value {
        Some(Value::String(s)) => s.as_str(),
        Some(Value::Enum(_, s)) => s.as_str(),
        _ => return fallback.to_string(),
    };
    let sanitized: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if sanitized.is_empty() {
        fallback.to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(project: &str, user: &str) -> Value {
        Value::Record(vec![
            ("projectId".into(), Value::String(project.into())),
            ("userId".into(), Value::String(user.into())),
            ("sourceId".into(), Value::String("source-1".into())),
        ])
    }

    fn value_with_time(time: f64) -> Value {
        Value::Record(vec![("time".into(), Value::Double(time))])
    }

    fn factory() -> RecordPathFactory {
        RecordPathFactory::new("/out", TimeBinFormat::Hourly, ".csv".into())
    }

    #[test]
    fn value_time_selects_hourly_bin() {
        // 1493711175 s = Tue 2017-05-02 07:46:15 UTC.
        let org = factory().organize("t", &key("p", "u"), &value_with_time(1_493_711_175.0), 0);
        assert_eq!(org.path, PathBuf::from("/out/p/u/t/20170502_0700.csv"));
        assert_eq!(org.category, "source-1");
    }

    #[test]
    fn windowed_key_start_selects_bin() {
        let start = (1_493_711_175 - 3600) * 1000;
        let key = Value::Record(vec![
            ("projectId".into(), Value::String("p".into())),
            ("userId".into(), Value::String("u".into())),
            ("start".into(), Value::Long(start)),
        ]);
        let value = Value::Record(vec![("x".into(), Value::Int(1))]);
        let org = factory().organize("t", &key, &value, 0);
        assert_eq!(org.path, PathBuf::from("/out/p/u/t/20170502_0600.csv"));
        assert_eq!(org.category, "unknown-source");
    }

    #[test]
    fn value_time_wins_over_key_start() {
        let key = Value::Record(vec![("start".into(), Value::Long(0))]);
        let org = factory().organize("t", &key, &value_with_time(1_493_711_175.0), 0);
        assert!(org.path.ends_with("unknown-project/unknown-user/t/20170502_0700.csv"));
    }

    #[test]
    fn missing_time_and_start_lands_in_unknown_date() {
        let value = Value::Record(vec![("x".into(), Value::Int(1))]);
        let org = factory().organize("t", &key("p", "u"), &value, 0);
        assert_eq!(org.path, PathBuf::from("/out/p/u/t/unknown_date.csv"));
        assert_eq!(org.time, None);
    }

    #[test]
    fn monthly_format_and_attempt_suffix() {
        let factory = RecordPathFactory::new("/out", TimeBinFormat::Monthly, ".json.gz".into());
        let org = factory.organize("t", &key("p", "u"), &value_with_time(1_493_711_175.0), 2);
        assert_eq!(org.path, PathBuf::from("/out/p/u/t/201705_2.json.gz"));
    }

    #[test]
    fn identities_are_sanitized() {
        let key = Value::Record(vec![
            ("projectId".into(), Value::String("p#roj/x!".into())),
            ("userId".into(), Value::String("@@@".into())),
        ]);
        let org = factory().organize("t", &key, &value_with_time(0.0), 0);
        assert!(org.path.starts_with("/out/projx/unknown-user/t"));
    }

    #[test]
    fn union_wrapped_key_fields_resolve() {
        let key = Value::Record(vec![(
            "projectId".into(),
            Value::Union(1, Box::new(Value::String("p".into()))),
        )]);
        let org = factory().organize("t", &key, &value_with_time(0.0), 0);
        assert!(org.path.starts_with("/out/p/unknown-user/t"));
    }

    #[test]
    fn bin_format_parses_from_config_names() {
        assert_eq!(
            TimeBinFormat::from_str("hourly").unwrap(),
            TimeBinFormat::Hourly
        );
        assert_eq!(
            TimeBinFormat::from_str("monthly").unwrap(),
            TimeBinFormat::Monthly
        );
        assert!(TimeBinFormat::from_str("daily").is_err());
    }
}
