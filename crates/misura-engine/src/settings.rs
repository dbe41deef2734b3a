//! Shallow settings validation.
//!
//! Turns a free-form JSON document into a canonicalized [`Settings`]
//! value: recognized keys are type-checked, unknown keys are stripped
//! with a warning, and enum-valued fields are resolved. Rejections come
//! back as human-readable messages the task turns into `LOG` plus
//! `FAILURE` events.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::event::EventType;
use crate::logger::verbosity;

/// A typed option value: measurements accept strings, ints and floats.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Float view; integers widen.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            OptionValue::Float(x) => Some(*x),
            OptionValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }
}

pub type Options = BTreeMap<String, OptionValue>;

/// Canonicalized settings. `document()` exposes the cleaned JSON form:
/// the input minus unknown keys.
#[derive(Debug)]
pub struct Settings {
    doc: Value,
    pub task_type: String,
    pub options: Options,
    pub verbosity: u32,
    pub disabled_events: HashSet<EventType>,
    pub annotations: Map<String, Value>,
    pub inputs: Vec<String>,
    pub input_files: Vec<String>,
    pub log_file: Option<PathBuf>,
    pub output_file: Option<PathBuf>,
}

impl Settings {
    pub fn document(&self) -> &Value {
        &self.doc
    }

    pub fn is_event_enabled(&self, ty: EventType) -> bool {
        !self.disabled_events.contains(&ty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    String,
    Object,
    Array,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::String => "string",
            Kind::Object => "object",
            Kind::Array => "array",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Kind::String => value.is_string(),
            Kind::Object => value.is_object(),
            Kind::Array => value.is_array(),
        }
    }
}

/// The recognized top-level keys: name, kind, mandatory.
const KNOWN_KEYS: [(&str, Kind, bool); 9] = [
    ("type", Kind::String, true),
    ("options", Kind::Object, false),
    ("verbosity", Kind::String, false),
    ("disabled_events", Kind::Array, false),
    ("annotations", Kind::Object, false),
    ("inputs", Kind::Array, false),
    ("input_files", Kind::Array, false),
    ("log_file", Kind::String, false),
    ("output_file", Kind::String, false),
];

/// Validate `doc` shallowly. Warnings (unknown keys, unknown disabled
/// events) go through `warn`; hard rejections return the message.
pub fn validate(doc: &Value, warn: &mut dyn FnMut(String)) -> Result<Settings, String> {
    let root = match doc.as_object() {
        Some(root) => root,
        None => {
            return Err(format!(
                "invalid settings type: expected a JSON object (e.g. \
                 '{{\"type\": \"NDT\"}}') but got: '{doc}'"
            ))
        }
    };

    // Shallow shape check over the recognized keys. Report every problem
    // before rejecting, so the consumer sees the full picture at once.
    let mut ok = true;
    for (name, kind, mandatory) in KNOWN_KEYS {
        match root.get(name) {
            None if mandatory => {
                warn(format!(
                    "missing required setting '{name}' (fyi: '{name}' \
                     should be a {})",
                    kind.name()
                ));
                ok = false;
            }
            Some(value) if !kind.matches(value) => {
                warn(format!(
                    "found setting '{name}' with invalid type (fyi: \
                     '{name}' should be a {})",
                    kind.name()
                ));
                ok = false;
            }
            _ => {}
        }
    }
    if !ok {
        return Err("failed to validate settings".to_string());
    }

    // Strip unknown keys so nothing below (or downstream) can depend on
    // a setting that is not part of the schema.
    let mut cleaned = root.clone();
    let unknown: Vec<String> = cleaned
        .keys()
        .filter(|key| !KNOWN_KEYS.iter().any(|(name, _, _)| name == key))
        .cloned()
        .collect();
    for key in unknown {
        warn(format!(
            "found unknown setting key '{key}' which will be ignored"
        ));
        cleaned.remove(&key);
    }

    let task_type = cleaned
        .get("type")
        .and_then(Value::as_str)
        .expect("checked above")
        .to_string();

    let mut options = Options::new();
    if let Some(object) = cleaned.get("options").and_then(Value::as_object) {
        for (key, value) in object {
            let typed = if let Some(s) = value.as_str() {
                OptionValue::Str(s.to_string())
            } else if let Some(n) = value.as_i64() {
                OptionValue::Int(n)
            } else if let Some(x) = value.as_f64() {
                OptionValue::Float(x)
            } else {
                return Err(format!(
                    "found option '{key}' with an invalid type (fyi: \
                     valid option types are: int, double, string)"
                ));
            };
            options.insert(key.clone(), typed);
        }
    }

    let verbosity_level = match cleaned.get("verbosity").and_then(Value::as_str) {
        Some(name) => match verbosity::from_name(name) {
            Some(level) => level,
            None => {
                return Err(format!(
                    "unknown verbosity level '{name}' (fyi: known \
                     verbosity levels are: {})",
                    known_verbosity_levels()
                ))
            }
        },
        None => verbosity::QUIET,
    };

    let mut disabled_events = HashSet::new();
    if let Some(entries) = cleaned.get("disabled_events").and_then(Value::as_array) {
        for entry in entries {
            let name = match entry.as_str() {
                Some(name) => name,
                None => {
                    return Err(format!(
                        "found invalid entry inside disabled_events with \
                         value <{entry}> (fyi: all entries in \
                         disabled_events must be strings)"
                    ))
                }
            };
            match EventType::from_name(name) {
                Some(ty) => {
                    disabled_events.insert(ty);
                }
                None => warn(format!(
                    "found unknown event '{name}' inside disabled_events \
                     (fyi: all valid events are: {}); ignoring it and \
                     continuing",
                    known_events()
                )),
            }
        }
    }

    let annotations = match cleaned.get("annotations").and_then(Value::as_object) {
        Some(object) => {
            for (key, value) in object {
                if !(value.is_string() || value.is_number()) {
                    return Err(format!(
                        "found annotation '{key}' with an invalid type \
                         (fyi: annotations hold strings and numbers)"
                    ));
                }
            }
            object.clone()
        }
        None => Map::new(),
    };

    let inputs = string_array(&cleaned, "inputs")?;
    let input_files = string_array(&cleaned, "input_files")?;

    let log_file = cleaned
        .get("log_file")
        .and_then(Value::as_str)
        .map(PathBuf::from);
    let output_file = cleaned
        .get("output_file")
        .and_then(Value::as_str)
        .map(PathBuf::from);

    Ok(Settings {
        doc: Value::Object(cleaned),
        task_type,
        options,
        verbosity: verbosity_level,
        disabled_events,
        annotations,
        inputs,
        input_files,
        log_file,
        output_file,
    })
}

fn string_array(root: &Map<String, Value>, key: &str) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    if let Some(entries) = root.get(key).and_then(Value::as_array) {
        for entry in entries {
            match entry.as_str() {
                Some(s) => out.push(s.to_string()),
                None => {
                    return Err(format!(
                        "found non-string entry inside '{key}': <{entry}>"
                    ))
                }
            }
        }
    }
    Ok(out)
}

pub(crate) fn known_events() -> String {
    let names: Vec<&str> = EventType::ALL.iter().map(|ty| ty.as_str()).collect();
    serde_json::to_string(&names).expect("static data")
}

fn known_verbosity_levels() -> String {
    let names: Vec<&str> = verbosity::NAMES.iter().map(|(name, _)| *name).collect();
    serde_json::to_string(&names).expect("static data")
}
