//! Metric definitions.
//!
//! A [`MetricDefinition`] is compiled once from a [`MetricSpec`] into a set of
//! extraction rules (key, value, count, partition). Evaluating a record walks
//! those rules and yields an [`Evaluation`] or nothing at all:
//! - keys come from `each_key` fields, or the singleton `[name]`
//! - the value is parsed as int or float, falling back to `default_value`
//! - the count comes from `count_key`, where a parsed `0` counts as `1`
//! - the partition is a raw record field or the event time truncated to a
//!   day, hour, minute or second
//!
//! Records failing key or value extraction are skipped for that definition
//! only; [`MetricsRegistry`] evaluates every definition independently.

pub mod registry;

pub use registry::MetricsRegistry;

use crate::config::MetricSpec;
use crate::error::{Result, RollupError};
use chrono::{Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::ops::AddAssign;

/// A structured input record.
pub type Record = Map<String, Value>;

/// An additive numeric value extracted from a record.
///
/// Integer sums saturate at the `i64` bounds instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Float(v) => v,
        }
    }

    /// Plain JSON number, as written to sinks.
    pub fn to_json(&self) -> Value {
        match *self {
            MetricValue::Int(v) => Value::from(v),
            MetricValue::Float(v) => Value::from(v),
        }
    }
}

impl AddAssign for MetricValue {
    fn add_assign(&mut self, rhs: MetricValue) {
        *self = match (*self, rhs) {
            (MetricValue::Int(a), MetricValue::Int(b)) => MetricValue::Int(a.saturating_add(b)),
            (a, b) => MetricValue::Float(a.as_f64() + b.as_f64()),
        };
    }
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Numeric type of a metric's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    #[default]
    Int,
    Float,
}

impl ValueType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "int" => Ok(ValueType::Int),
            "float" => Ok(ValueType::Float),
            other => Err(RollupError::invalid_config(format!(
                "unexpected 'type' parameter {:?} on metrics: expected int or float",
                other
            ))),
        }
    }

    /// Parses a record value leniently: strings contribute their leading
    /// numeric prefix, anything non-numeric becomes zero.
    pub fn coerce(&self, value: &Value) -> MetricValue {
        match self {
            ValueType::Int => MetricValue::Int(coerce_int(value)),
            ValueType::Float => MetricValue::Float(coerce_float(value)),
        }
    }

    fn coerce_str(&self, s: &str) -> MetricValue {
        match self {
            ValueType::Int => MetricValue::Int(int_prefix(s)),
            ValueType::Float => MetricValue::Float(float_prefix(s)),
        }
    }

    fn one(&self) -> MetricValue {
        match self {
            ValueType::Int => MetricValue::Int(1),
            ValueType::Float => MetricValue::Float(1.0),
        }
    }
}

/// Time granularity of a time-derived partition label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Hour,
    Minute,
    Second,
}

impl Granularity {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "daily" | "day" | "d" => Ok(Granularity::Day),
            "hourly" | "hour" | "h" => Ok(Granularity::Hour),
            "minutely" | "minute" | "m" => Ok(Granularity::Minute),
            "secondly" | "second" | "s" => Ok(Granularity::Second),
            other => Err(RollupError::invalid_config(format!(
                "unexpected 'partition_by' parameter {:?} on metrics: expected daily, hourly, minutely or secondly",
                other
            ))),
        }
    }

    pub fn time_format(&self) -> &'static str {
        match self {
            Granularity::Day => "%Y-%m-%d",
            Granularity::Hour => "%Y-%m-%d %H",
            Granularity::Minute => "%Y-%m-%d %H:%M",
            Granularity::Second => "%Y-%m-%d %H:%M:%S",
        }
    }

    /// Formats a unix timestamp (seconds) into a truncated label.
    pub fn label(&self, timestamp: i64, utc: bool) -> Option<String> {
        let fmt = self.time_format();
        if utc {
            Utc.timestamp_opt(timestamp, 0)
                .single()
                .map(|t| t.format(fmt).to_string())
        } else {
            Local
                .timestamp_opt(timestamp, 0)
                .single()
                .map(|t| t.format(fmt).to_string())
        }
    }
}

#[derive(Debug, Clone)]
enum KeyRule {
    /// No `each_key`: every record keys to `[name]`.
    Constant(Vec<Value>),
    Fields(Vec<String>),
}

#[derive(Debug, Clone)]
enum ValueRule {
    Constant(MetricValue),
    Field {
        field: String,
        default: Option<MetricValue>,
        value_type: ValueType,
    },
}

#[derive(Debug, Clone)]
enum CountRule {
    One,
    Field(String),
}

#[derive(Debug, Clone)]
enum PartitionRule {
    Field(String),
    Time { granularity: Granularity, utc: bool },
}

/// Result of evaluating one definition against one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Raw key values in `each_key` order, or `[name]` for key-less metrics.
    pub keys: Vec<Value>,
    pub value: MetricValue,
    pub count: i64,
    pub partition: String,
}

/// A configured metric rule, compiled once and reused for every record.
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    name: String,
    value_field: Option<String>,
    key_rule: KeyRule,
    value_rule: ValueRule,
    count_rule: CountRule,
    partition_rule: PartitionRule,
}

impl MetricDefinition {
    /// Compiles a definition, failing with `InvalidConfig` on a missing name
    /// or an unrecognized `type`/`partition_by`.
    pub fn configure(spec: &MetricSpec) -> Result<Self> {
        let name = spec
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| RollupError::invalid_config("'name' parameter is required on metrics"))?
            .to_string();

        let value_type = match spec.value_type.as_deref() {
            Some(t) => ValueType::parse(t)?,
            None => ValueType::Int,
        };

        let key_fields: Vec<String> = spec
            .each_key
            .as_deref()
            .map(|keys| {
                keys.split(',')
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let key_rule = if key_fields.is_empty() {
            KeyRule::Constant(vec![Value::String(name.clone())])
        } else {
            KeyRule::Fields(key_fields)
        };

        let default = spec
            .default_value
            .as_deref()
            .map(|dv| value_type.coerce_str(dv));
        let value_rule = match &spec.value_key {
            Some(field) => ValueRule::Field {
                field: field.clone(),
                default,
                value_type,
            },
            None => ValueRule::Constant(default.unwrap_or_else(|| value_type.one())),
        };

        let count_rule = match &spec.count_key {
            Some(field) => CountRule::Field(field.clone()),
            None => CountRule::One,
        };

        let partition_rule = match &spec.partition_key {
            Some(field) => PartitionRule::Field(field.clone()),
            None => PartitionRule::Time {
                granularity: Granularity::parse(spec.partition_by.as_deref().unwrap_or("hourly"))?,
                utc: spec.is_utc(),
            },
        };

        Ok(Self {
            name,
            value_field: spec.value_key.clone(),
            key_rule,
            value_rule,
            count_rule,
            partition_rule,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured `each_key` fields; empty for key-less definitions.
    pub fn key_fields(&self) -> &[String] {
        match &self.key_rule {
            KeyRule::Fields(fields) => fields,
            KeyRule::Constant(_) => &[],
        }
    }

    pub fn value_field(&self) -> Option<&str> {
        self.value_field.as_deref()
    }

    /// Evaluates the record at `timestamp` (unix seconds).
    ///
    /// Returns `None` when a key field or a required value is missing; a
    /// partial key list is never produced.
    pub fn evaluate(&self, timestamp: i64, record: &Record) -> Option<Evaluation> {
        let keys = self.extract_keys(record)?;
        let value = self.extract_value(record)?;
        let count = self.extract_count(record);
        let partition = self.extract_partition(timestamp, record)?;

        Some(Evaluation {
            keys,
            value,
            count,
            partition,
        })
    }

    fn extract_keys(&self, record: &Record) -> Option<Vec<Value>> {
        match &self.key_rule {
            KeyRule::Constant(keys) => Some(keys.clone()),
            KeyRule::Fields(fields) => fields
                .iter()
                .map(|field| record.get(field).filter(|v| !v.is_null()).cloned())
                .collect(),
        }
    }

    fn extract_value(&self, record: &Record) -> Option<MetricValue> {
        match &self.value_rule {
            ValueRule::Constant(v) => Some(*v),
            ValueRule::Field {
                field,
                default,
                value_type,
            } => match record.get(field) {
                Some(v) if !v.is_null() => Some(value_type.coerce(v)),
                _ => *default,
            },
        }
    }

    fn extract_count(&self, record: &Record) -> i64 {
        match &self.count_rule {
            CountRule::One => 1,
            CountRule::Field(field) => {
                let count = record.get(field).map(coerce_int).unwrap_or(0);
                // A zero (or missing) count is counted once.
                if count == 0 {
                    1
                } else {
                    count
                }
            }
        }
    }

    fn extract_partition(&self, timestamp: i64, record: &Record) -> Option<String> {
        match &self.partition_rule {
            PartitionRule::Field(field) => record.get(field).and_then(key_string),
            PartitionRule::Time { granularity, utc } => granularity.label(timestamp, *utc),
        }
    }
}

/// Text form of a key value as it enters identities and partition ids:
/// strings as-is, anything else as its JSON text.
pub fn key_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Partition label of a record field; `null` is absent.
fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(key_label(other)),
    }
}

fn coerce_int(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => int_prefix(s),
        _ => 0,
    }
}

fn coerce_float(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => float_prefix(s),
        _ => 0.0,
    }
}

fn int_prefix(s: &str) -> i64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    s[..end].parse().unwrap_or(0)
}

fn float_prefix(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = s
        .find(|c: char| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E')))
        .unwrap_or(s.len());
    while end > 0 {
        if let Ok(v) = s[..end].parse::<f64>() {
            return v;
        }
        end -= 1;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn spec(name: &str) -> MetricSpec {
        MetricSpec {
            name: Some(name.to_string()),
            utc: Some(true),
            ..Default::default()
        }
    }

    // 2024-03-05 14:00:00 UTC
    const T: i64 = 1_709_647_200;

    #[test]
    fn test_keyless_definition_keys_to_name() {
        let def = MetricDefinition::configure(&spec("requests")).unwrap();
        let eval = def.evaluate(T, &record(json!({"host": "a"}))).unwrap();
        assert_eq!(eval.keys, vec![json!("requests")]);
        assert_eq!(eval.value, MetricValue::Int(1));
        assert_eq!(eval.count, 1);
        assert_eq!(eval.partition, "2024-03-05 14");
    }

    #[test]
    fn test_missing_key_field_skips_whole_evaluation() {
        let mut s = spec("req");
        s.each_key = Some("a, b".to_string());
        let def = MetricDefinition::configure(&s).unwrap();

        assert_eq!(def.key_fields(), &["a".to_string(), "b".to_string()]);
        assert!(def.evaluate(T, &record(json!({"a": "x"}))).is_none());
        assert!(def.evaluate(T, &record(json!({"a": "x", "b": null}))).is_none());

        let eval = def.evaluate(T, &record(json!({"a": "x", "b": 7}))).unwrap();
        assert_eq!(eval.keys, vec![json!("x"), json!(7)]);
    }

    #[test]
    fn test_value_extraction_and_defaults() {
        let mut s = spec("latency");
        s.value_key = Some("ms".to_string());
        let def = MetricDefinition::configure(&s).unwrap();
        assert_eq!(def.evaluate(T, &record(json!({"ms": "42ms"}))).unwrap().value, MetricValue::Int(42));
        assert_eq!(def.evaluate(T, &record(json!({"ms": 3.9}))).unwrap().value, MetricValue::Int(3));
        // value field configured, absent, and no default
        assert!(def.evaluate(T, &record(json!({}))).is_none());

        s.default_value = Some("5".to_string());
        let def = MetricDefinition::configure(&s).unwrap();
        assert_eq!(def.evaluate(T, &record(json!({}))).unwrap().value, MetricValue::Int(5));

        let mut f = spec("ratio");
        f.value_type = Some("float".to_string());
        let def = MetricDefinition::configure(&f).unwrap();
        assert_eq!(def.evaluate(T, &record(json!({}))).unwrap().value, MetricValue::Float(1.0));

        f.value_key = Some("r".to_string());
        let def = MetricDefinition::configure(&f).unwrap();
        assert_eq!(def.evaluate(T, &record(json!({"r": "0.25"}))).unwrap().value, MetricValue::Float(0.25));
    }

    #[test]
    fn test_zero_count_is_counted_once() {
        let mut s = spec("batches");
        s.count_key = Some("n".to_string());
        let def = MetricDefinition::configure(&s).unwrap();

        assert_eq!(def.evaluate(T, &record(json!({"n": 0}))).unwrap().count, 1);
        assert_eq!(def.evaluate(T, &record(json!({"n": "0"}))).unwrap().count, 1);
        assert_eq!(def.evaluate(T, &record(json!({}))).unwrap().count, 1);
        assert_eq!(def.evaluate(T, &record(json!({"n": 12}))).unwrap().count, 12);
    }

    #[test]
    fn test_hourly_utc_partition_labels() {
        let def = MetricDefinition::configure(&spec("req")).unwrap();
        let r = record(json!({}));
        let a = def.evaluate(T + 5, &r).unwrap().partition;
        let b = def.evaluate(T + 3599, &r).unwrap().partition;
        let c = def.evaluate(T + 3600, &r).unwrap().partition;
        assert_eq!(a, b);
        assert_ne!(b, c);
        assert_eq!(c, "2024-03-05 15");
    }

    #[test]
    fn test_partition_granularities() {
        let cases = [
            ("daily", "2024-03-05"),
            ("d", "2024-03-05"),
            ("minutely", "2024-03-05 14:02"),
            ("secondly", "2024-03-05 14:02:03"),
        ];
        for (by, expected) in cases {
            let mut s = spec("req");
            s.partition_by = Some(by.to_string());
            let def = MetricDefinition::configure(&s).unwrap();
            let eval = def.evaluate(T + 123, &record(json!({}))).unwrap();
            assert_eq!(eval.partition, expected, "partition_by = {}", by);
        }
    }

    #[test]
    fn test_partition_key_reads_raw_field() {
        let mut s = spec("req");
        s.partition_key = Some("bucket".to_string());
        let def = MetricDefinition::configure(&s).unwrap();
        let eval = def.evaluate(T, &record(json!({"bucket": "2024-W10"}))).unwrap();
        assert_eq!(eval.partition, "2024-W10");
        assert!(def.evaluate(T, &record(json!({}))).is_none());
    }

    #[test]
    fn test_invalid_configuration() {
        let mut s = spec("req");
        s.value_type = Some("decimal".to_string());
        assert!(matches!(MetricDefinition::configure(&s), Err(RollupError::InvalidConfig(_))));

        let mut s = spec("req");
        s.partition_by = Some("weekly".to_string());
        assert!(matches!(MetricDefinition::configure(&s), Err(RollupError::InvalidConfig(_))));

        let s = MetricSpec::default();
        assert!(matches!(MetricDefinition::configure(&s), Err(RollupError::InvalidConfig(_))));
    }

    #[test]
    fn test_localtime_wins_over_utc() {
        let mut s = spec("req");
        s.localtime = Some(true);
        assert!(!s.is_utc());
        s.localtime = None;
        assert!(s.is_utc());
    }

    #[test]
    fn test_metric_value_addition() {
        let mut v = MetricValue::Int(2);
        v += MetricValue::Int(3);
        assert_eq!(v, MetricValue::Int(5));
        v += MetricValue::Float(0.5);
        assert_eq!(v, MetricValue::Float(5.5));
    }

    #[test]
    fn test_integer_sum_saturates() {
        let mut v = MetricValue::Int(i64::MAX);
        v += MetricValue::Int(1);
        assert_eq!(v, MetricValue::Int(i64::MAX));

        let mut v = MetricValue::Int(i64::MIN);
        v += MetricValue::Int(-5);
        assert_eq!(v, MetricValue::Int(i64::MIN));
    }

    #[test]
    fn test_key_label_keeps_strings_bare() {
        assert_eq!(key_label(&json!("web-1")), "web-1");
        assert_eq!(key_label(&json!(200)), "200");
        assert_eq!(key_label(&json!(true)), "true");
    }

    #[test]
    fn test_keyless_definition_has_no_key_fields() {
        let def = MetricDefinition::configure(&spec("requests")).unwrap();
        assert!(def.key_fields().is_empty());
    }
}
