//! Event records, parameter values, and the packages handed to consumers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Domain reserved for events forwarded from the operating system.
pub const DOMAIN_OS: &str = "OS";

/// Event categories.
///
/// The numeric values are part of the persisted format and of the filter
/// bitmask (`1 << value`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// A fault or crash.
    Fault = 1,
    /// A statistical sample.
    Statistic = 2,
    /// A security-relevant action.
    Security = 3,
    /// A user behaviour record.
    Behavior = 4,
}

impl EventType {
    /// Returns the numeric code for this type.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Attempts to convert a numeric code to an `EventType`.
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Fault),
            2 => Some(Self::Statistic),
            3 => Some(Self::Security),
            4 => Some(Self::Behavior),
            _ => None,
        }
    }

    /// Returns the bit this type occupies in a filter mask.
    pub fn mask_bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Returns the string label for this type.
    pub fn label(self) -> &'static str {
        match self {
            Self::Fault => "FAULT",
            Self::Statistic => "STATISTIC",
            Self::Security => "SECURITY",
            Self::Behavior => "BEHAVIOR",
        }
    }
}

/// A parameter value: a scalar or a homogeneous array of scalars.
///
/// Serialises untagged so the JSON form is the bare value. On the way back in,
/// numbers that fit `i64` come back as `Int` and everything else as `Double`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Float(f32),
    String(String),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    DoubleArray(Vec<f64>),
    FloatArray(Vec<f32>),
    StringArray(Vec<String>),
}

impl ParamValue {
    /// Stable type tag stored next to custom parameters.
    pub fn type_code(&self) -> i32 {
        match self {
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Double(_) => 3,
            Self::Float(_) => 4,
            Self::String(_) => 5,
            Self::BoolArray(_) => 6,
            Self::IntArray(_) => 7,
            Self::DoubleArray(_) => 8,
            Self::FloatArray(_) => 9,
            Self::StringArray(_) => 10,
        }
    }

    /// Number of elements for array values, `None` for scalars.
    pub fn array_len(&self) -> Option<usize> {
        match self {
            Self::BoolArray(v) => Some(v.len()),
            Self::IntArray(v) => Some(v.len()),
            Self::DoubleArray(v) => Some(v.len()),
            Self::FloatArray(v) => Some(v.len()),
            Self::StringArray(v) => Some(v.len()),
            _ => None,
        }
    }

    /// Truncates array values to at most `max` elements.
    ///
    /// Returns `true` if anything was cut off.
    pub fn truncate_array(&mut self, max: usize) -> bool {
        let len = self.array_len().unwrap_or(0);
        if len <= max {
            return false;
        }
        match self {
            Self::BoolArray(v) => v.truncate(max),
            Self::IntArray(v) => v.truncate(max),
            Self::DoubleArray(v) => v.truncate(max),
            Self::FloatArray(v) => v.truncate(max),
            Self::StringArray(v) => v.truncate(max),
            _ => {}
        }
        true
    }

    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Converts a JSON value read back from storage into a parameter value.
    pub fn from_json(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Rebuilds a value from its stored JSON text and [`type_code`](Self::type_code).
    ///
    /// The tag disambiguates floating-point values, which JSON alone cannot.
    pub fn from_stored(json: &str, type_code: i32) -> Option<Self> {
        let value: Value = serde_json::from_str(json).ok()?;
        let floats = |v: &Value| -> Option<Vec<f64>> {
            v.as_array()?.iter().map(Value::as_f64).collect()
        };
        match type_code {
            3 => value.as_f64().map(Self::Double),
            4 => value.as_f64().map(|f| Self::Float(f as f32)),
            8 => floats(&value).map(Self::DoubleArray),
            9 => floats(&value).map(|v| Self::FloatArray(v.into_iter().map(|f| f as f32).collect())),
            _ => Self::from_json(&value),
        }
    }

    /// JSON text used when storing the value out-of-band.
    pub fn to_stored(&self) -> String {
        self.to_json().to_string()
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<bool>> for ParamValue {
    fn from(v: Vec<bool>) -> Self {
        Self::BoolArray(v)
    }
}

impl From<Vec<i64>> for ParamValue {
    fn from(v: Vec<i64>) -> Self {
        Self::IntArray(v)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> Self {
        Self::DoubleArray(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        Self::StringArray(v)
    }
}

/// A named parameter attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventParam {
    pub name: String,
    pub value: ParamValue,
}

impl EventParam {
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single application event.
///
/// `seq` stays 0 until the record has been inserted into the event cache; the
/// cache assigns it exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Database sequence number, 0 while unpersisted.
    pub seq: i64,
    pub domain: String,
    pub name: String,
    pub event_type: EventType,
    /// Creation time in milliseconds since the Unix epoch.
    pub time: i64,
    /// UTC offset at creation, e.g. `+0800`.
    pub tz: String,
    pub pid: i32,
    pub tid: i64,
    pub trace_id: i64,
    pub span_id: i64,
    pub pspan_id: i64,
    pub trace_flag: i32,
    /// Inline parameters, in insertion order.
    pub params: Vec<EventParam>,
    /// Parameters to store out-of-band under (running id, domain, name).
    pub custom_params: Vec<EventParam>,
    /// Identifier of the process instance that wrote the event.
    pub running_id: String,
}

impl EventRecord {
    /// Creates an unstamped, unpersisted event.
    pub fn new(domain: impl Into<String>, name: impl Into<String>, event_type: EventType) -> Self {
        Self {
            seq: 0,
            domain: domain.into(),
            name: name.into(),
            event_type,
            time: 0,
            tz: String::new(),
            pid: 0,
            tid: 0,
            trace_id: 0,
            span_id: 0,
            pspan_id: 0,
            trace_flag: 0,
            params: Vec::new(),
            custom_params: Vec::new(),
            running_id: String::new(),
        }
    }

    /// Appends an inline parameter.
    pub fn add_param(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.params.push(EventParam::new(name, value));
    }

    /// Builder form of [`add_param`](Self::add_param).
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.add_param(name, value);
        self
    }

    /// Returns the value of the named inline parameter, if present.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    fn params_object(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        for p in &self.params {
            obj.insert(p.name.clone(), p.value.to_json());
        }
        obj
    }

    /// Serialises the inline parameters as a JSON object string.
    pub fn param_str(&self) -> String {
        Value::Object(self.params_object()).to_string()
    }

    /// Replaces the inline parameters with the contents of a JSON object string.
    ///
    /// An empty string clears the parameters. Entries whose value is not a
    /// supported parameter shape are skipped.
    pub fn set_param_str(&mut self, json: &str) -> Result<(), serde_json::Error> {
        self.params.clear();
        if json.trim().is_empty() {
            return Ok(());
        }
        let obj: Map<String, Value> = serde_json::from_str(json)?;
        for (name, value) in obj {
            if let Some(v) = ParamValue::from_json(&value) {
                self.params.push(EventParam { name, value: v });
            }
        }
        Ok(())
    }

    /// Merges out-of-band parameters; inline parameters with the same name win.
    pub fn add_custom_params(&mut self, custom: impl IntoIterator<Item = EventParam>) {
        for param in custom {
            if self.params.iter().any(|p| p.name == param.name) {
                continue;
            }
            self.params.push(param);
        }
    }

    /// Serialises the whole event as the single-line JSON used in log files.
    pub fn event_str(&self) -> String {
        let mut obj = Map::new();
        obj.insert("domain_".into(), Value::from(self.domain.clone()));
        obj.insert("name_".into(), Value::from(self.name.clone()));
        obj.insert("type_".into(), Value::from(self.event_type.as_i32()));
        obj.insert("time_".into(), Value::from(self.time));
        obj.insert("tz_".into(), Value::from(self.tz.clone()));
        obj.insert("pid_".into(), Value::from(self.pid));
        obj.insert("tid_".into(), Value::from(self.tid));
        if self.trace_id != 0 {
            obj.insert("trace_id_".into(), Value::from(format!("{:x}", self.trace_id)));
            obj.insert("span_id_".into(), Value::from(format!("{:x}", self.span_id)));
            obj.insert("pspan_id_".into(), Value::from(format!("{:x}", self.pspan_id)));
            obj.insert("trace_flag_".into(), Value::from(self.trace_flag));
        }
        obj.insert("params".into(), Value::Object(self.params_object()));
        Value::Object(obj).to_string()
    }

    /// Serialised size in bytes, used for size-based triggers.
    pub fn event_size(&self) -> usize {
        self.event_str().len()
    }

    /// Flattened view handed to processor backends.
    pub fn to_info(&self) -> AppEventInfo {
        AppEventInfo {
            domain: self.domain.clone(),
            name: self.name.clone(),
            event_type: self.event_type,
            timestamp: self.time,
            params: self.param_str(),
        }
    }
}

/// Event summary passed to report backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppEventInfo {
    pub domain: String,
    pub name: String,
    pub event_type: EventType,
    pub timestamp: i64,
    /// Parameters as a JSON object string.
    pub params: String,
}

/// A batch of events taken from the cache by a pull-style holder.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPackage {
    /// Increments from 0 per holder.
    pub package_id: i32,
    pub row: usize,
    /// Sum of the serialised sizes of `data`.
    pub size: usize,
    /// Serialised events, one JSON line each.
    pub data: Vec<String>,
    pub events: Vec<EventRecord>,
}
