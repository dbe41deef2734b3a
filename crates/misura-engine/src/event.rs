//! Events flowing from the task thread to the consumer.
//!
//! An event is an immutable JSON document with a mandatory `type`
//! discriminator and type-specific payload fields, flat in the envelope.

use std::fmt;

use serde_json::{Map, Value};

use crate::logger::verbosity;

/// The canonical event-type set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Queued,
    Started,
    Log,
    Configured,
    Progress,
    Performance,
    MeasurementError,
    ReportSubmissionError,
    Result,
    Failure,
    End,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::Queued,
        EventType::Started,
        EventType::Log,
        EventType::Configured,
        EventType::Progress,
        EventType::Performance,
        EventType::MeasurementError,
        EventType::ReportSubmissionError,
        EventType::Result,
        EventType::Failure,
        EventType::End,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Queued => "QUEUED",
            EventType::Started => "STARTED",
            EventType::Log => "LOG",
            EventType::Configured => "CONFIGURED",
            EventType::Progress => "PROGRESS",
            EventType::Performance => "PERFORMANCE",
            EventType::MeasurementError => "MEASUREMENT_ERROR",
            EventType::ReportSubmissionError => "REPORT_SUBMISSION_ERROR",
            EventType::Result => "RESULT",
            EventType::Failure => "FAILURE",
            EventType::End => "END",
        }
    }

    pub fn from_name(name: &str) -> Option<EventType> {
        EventType::ALL.iter().copied().find(|ty| ty.as_str() == name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed view over an event document.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    ty: EventType,
    doc: Value,
}

impl Event {
    fn new(ty: EventType, mut fields: Map<String, Value>) -> Event {
        fields.insert("type".into(), Value::from(ty.as_str()));
        Event {
            ty,
            doc: Value::Object(fields),
        }
    }

    pub fn queued() -> Event {
        Event::new(EventType::Queued, Map::new())
    }

    pub fn started() -> Event {
        Event::new(EventType::Started, Map::new())
    }

    pub fn configured() -> Event {
        Event::new(EventType::Configured, Map::new())
    }

    pub fn end() -> Event {
        Event::new(EventType::End, Map::new())
    }

    pub fn log(level: u32, message: &str) -> Event {
        let name = verbosity::name(level & verbosity::MASK).unwrap_or("WARNING");
        let mut fields = Map::new();
        fields.insert("verbosity".into(), Value::from(name));
        fields.insert("message".into(), Value::from(message));
        Event::new(EventType::Log, fields)
    }

    pub fn failure(reason: &str) -> Event {
        let mut fields = Map::new();
        fields.insert("failure".into(), Value::from(reason));
        Event::new(EventType::Failure, fields)
    }

    pub fn progress(percentage: f64, message: &str) -> Event {
        let mut fields = Map::new();
        fields.insert("percentage".into(), Value::from(percentage));
        fields.insert("message".into(), Value::from(message));
        Event::new(EventType::Progress, fields)
    }

    pub fn performance(
        direction: &str,
        elapsed_seconds: f64,
        num_streams: i64,
        speed_kbit_s: f64,
    ) -> Event {
        let mut fields = Map::new();
        fields.insert("direction".into(), Value::from(direction));
        fields.insert("elapsed_seconds".into(), Value::from(elapsed_seconds));
        fields.insert("num_streams".into(), Value::from(num_streams));
        fields.insert("speed_kbit_s".into(), Value::from(speed_kbit_s));
        Event::new(EventType::Performance, fields)
    }

    pub fn measurement_error(reason: &str, input: Option<&str>) -> Event {
        let mut fields = Map::new();
        fields.insert("failure".into(), Value::from(reason));
        if let Some(input) = input {
            fields.insert("input".into(), Value::from(input));
        }
        Event::new(EventType::MeasurementError, fields)
    }

    pub fn report_submission_error(reason: &str) -> Event {
        let mut fields = Map::new();
        fields.insert("failure".into(), Value::from(reason));
        Event::new(EventType::ReportSubmissionError, fields)
    }

    /// A serialized report entry produced by a runnable.
    pub fn result(entry: Value) -> Event {
        let mut fields = Map::new();
        fields.insert("entry".into(), entry);
        Event::new(EventType::Result, fields)
    }

    /// Adopt an existing document; fails unless it carries a known
    /// `type` discriminator.
    pub fn from_value(doc: Value) -> Option<Event> {
        let ty = doc
            .as_object()?
            .get("type")?
            .as_str()
            .and_then(EventType::from_name)?;
        Some(Event { ty, doc })
    }

    pub fn event_type(&self) -> EventType {
        self.ty
    }

    pub fn as_value(&self) -> &Value {
        &self.doc
    }

    pub fn serialize(&self) -> String {
        self.doc.to_string()
    }

    // ── Typed accessors ─────────────────────────────────────────────

    fn entry(&self, key: &str) -> Option<&Value> {
        self.doc.as_object().and_then(|map| map.get(key))
    }

    pub fn has_null_entry(&self, key: &str) -> bool {
        matches!(self.entry(key), Some(Value::Null))
    }

    pub fn has_string_entry(&self, key: &str) -> bool {
        matches!(self.entry(key), Some(Value::String(_)))
    }

    pub fn has_int_entry(&self, key: &str) -> bool {
        self.entry(key).is_some_and(|v| v.is_i64())
    }

    pub fn has_double_entry(&self, key: &str) -> bool {
        self.entry(key).is_some_and(|v| v.is_f64())
    }

    pub fn has_list_entry(&self, key: &str) -> bool {
        matches!(self.entry(key), Some(Value::Array(_)))
    }

    pub fn has_object_entry(&self, key: &str) -> bool {
        matches!(self.entry(key), Some(Value::Object(_)))
    }

    pub fn get_string_entry(&self, key: &str) -> Option<&str> {
        self.entry(key).and_then(Value::as_str)
    }

    pub fn get_int_entry(&self, key: &str) -> Option<i64> {
        self.entry(key).and_then(Value::as_i64)
    }

    pub fn get_double_entry(&self, key: &str) -> Option<f64> {
        self.entry(key).and_then(Value::as_f64)
    }

    pub fn get_serialized_list_entry(&self, key: &str) -> Option<String> {
        match self.entry(key) {
            Some(value @ Value::Array(_)) => Some(value.to_string()),
            _ => None,
        }
    }

    pub fn get_serialized_object_entry(&self, key: &str) -> Option<String> {
        match self.entry(key) {
            Some(value @ Value::Object(_)) => Some(value.to_string()),
            _ => None,
        }
    }
}

/// Translate a structured log line into a `PERFORMANCE` event, when the
/// line is one of the speed samples measurements produce.
pub(crate) fn performance_from_line(line: &str) -> Option<Event> {
    let inner: Value = serde_json::from_str(line).ok()?;
    let direction = match inner.get("type")?.as_str()? {
        "download-speed" => "download",
        "upload-speed" => "upload",
        _ => return None,
    };
    let elapsed = inner.get("elapsed")?.get(0)?.as_f64()?;
    let num_streams = inner.get("num_streams")?.as_i64()?;
    let speed = inner.get("speed")?.get(0)?.as_f64()?;
    Some(Event::performance(direction, elapsed, num_streams, speed))
}
