//! Runtime values of the sandbox and their conversions to and from JSON.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value as JsonValue;

use super::ast::FunctionDef;
use super::interpreter::{Abrupt, Interpreter};

pub(crate) type ArrayRef = Rc<RefCell<Vec<JsValue>>>;
pub(crate) type ObjectRef = Rc<RefCell<IndexMap<String, JsValue>>>;
pub(crate) type NativeFn = fn(&mut Interpreter, Vec<JsValue>) -> Result<JsValue, Abrupt>;

/// Nesting depth past which a structure is treated as circular.
const MAX_JSON_DEPTH: usize = 256;

#[derive(Clone)]
pub(crate) enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(ArrayRef),
    Object(ObjectRef),
    Function(Rc<Function>),
    RegExp(Rc<JsRegExp>),
    /// Milliseconds since the Unix epoch; `NaN` for an invalid date.
    Date(Rc<f64>),
}

pub(crate) enum Function {
    Closure {
        def: Rc<FunctionDef>,
        scope: usize,
    },
    Native {
        name: &'static str,
        call: NativeFn,
        /// Behaviour under `new`; `None` means the function is not a constructor.
        construct: Option<NativeFn>,
        members: IndexMap<String, JsValue>,
    },
}

pub(crate) struct JsRegExp {
    pub source: String,
    pub flags: String,
    pub regex: Regex,
}

impl JsRegExp {
    pub(crate) fn new(source: &str, flags: &str) -> Result<Self, regex::Error> {
        let mut inline = String::new();
        for flag in flags.chars() {
            match flag {
                'i' | 'm' | 's' => inline.push(flag),
                _ => {}
            }
        }
        let pattern = if inline.is_empty() {
            source.to_string()
        } else {
            format!("(?{inline}){source}")
        };
        Ok(Self {
            source: source.to_string(),
            flags: flags.to_string(),
            regex: Regex::new(&pattern)?,
        })
    }

    pub(crate) fn is_global(&self) -> bool {
        self.flags.contains('g')
    }
}

impl fmt::Debug for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsValue::String(text) => write!(f, "{text:?}"),
            other => f.write_str(&other.to_display_string()),
        }
    }
}

impl From<&str> for JsValue {
    fn from(value: &str) -> Self {
        JsValue::String(Rc::from(value))
    }
}

impl From<String> for JsValue {
    fn from(value: String) -> Self {
        JsValue::String(Rc::from(value))
    }
}

impl From<f64> for JsValue {
    fn from(value: f64) -> Self {
        JsValue::Number(value)
    }
}

impl From<bool> for JsValue {
    fn from(value: bool) -> Self {
        JsValue::Bool(value)
    }
}

impl JsValue {
    pub(crate) fn new_array(items: Vec<JsValue>) -> Self {
        JsValue::Array(Rc::new(RefCell::new(items)))
    }

    pub(crate) fn new_object(entries: IndexMap<String, JsValue>) -> Self {
        JsValue::Object(Rc::new(RefCell::new(entries)))
    }

    pub(crate) fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Undefined | JsValue::Null)
    }

    pub(crate) fn is_function(&self) -> bool {
        matches!(self, JsValue::Function(_))
    }

    pub(crate) fn truthy(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Bool(value) => *value,
            JsValue::Number(value) => *value != 0.0 && !value.is_nan(),
            JsValue::String(text) => !text.is_empty(),
            _ => true,
        }
    }

    pub(crate) fn type_of(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Bool(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
            JsValue::Function(_) => "function",
            JsValue::Null | JsValue::Array(_) | JsValue::Object(_) | JsValue::RegExp(_) | JsValue::Date(_) => "object",
        }
    }

    /// Name used in diagnostics, e.g. "Cannot read properties of undefined".
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            JsValue::Null => "null",
            JsValue::Array(_) => "array",
            other => other.type_of(),
        }
    }

    /// JavaScript `ToString`.
    pub(crate) fn to_display_string(&self) -> String {
        self.to_display_string_at(0)
    }

    fn to_display_string_at(&self, depth: usize) -> String {
        match self {
            JsValue::Undefined => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Bool(value) => value.to_string(),
            JsValue::Number(value) => format_number(*value),
            JsValue::String(text) => text.to_string(),
            JsValue::Array(items) => {
                if depth > MAX_JSON_DEPTH {
                    return String::new();
                }
                items
                    .borrow()
                    .iter()
                    .map(|item| {
                        if item.is_nullish() {
                            String::new()
                        } else {
                            item.to_display_string_at(depth + 1)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            JsValue::Object(_) => "[object Object]".to_string(),
            JsValue::Function(function) => match function.as_ref() {
                Function::Native { name, .. } => format!("function {name}() {{ [native code] }}"),
                Function::Closure { def, .. } => format!("function {}() {{ ... }}", def.name.as_deref().unwrap_or("")),
            },
            JsValue::RegExp(regexp) => format!("/{}/{}", regexp.source, regexp.flags),
            JsValue::Date(millis) => format_iso_date(**millis).unwrap_or_else(|| "Invalid Date".to_string()),
        }
    }

    /// JavaScript `ToNumber`.
    pub(crate) fn to_number(&self) -> f64 {
        match self {
            JsValue::Undefined => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Bool(value) => {
                if *value {
                    1.0
                } else {
                    0.0
                }
            }
            JsValue::Number(value) => *value,
            JsValue::String(text) => parse_numeric_string(text),
            JsValue::Array(_) => parse_numeric_string(&self.to_display_string()),
            JsValue::Date(millis) => **millis,
            _ => f64::NAN,
        }
    }

    /// Key used when the value indexes an object.
    pub(crate) fn to_property_key(&self) -> String {
        match self {
            JsValue::String(text) => text.to_string(),
            other => other.to_display_string(),
        }
    }

    pub(crate) fn strict_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) | (JsValue::Null, JsValue::Null) => true,
            (JsValue::Bool(a), JsValue::Bool(b)) => a == b,
            (JsValue::Number(a), JsValue::Number(b)) => a == b,
            (JsValue::String(a), JsValue::String(b)) => a == b,
            (JsValue::Array(a), JsValue::Array(b)) => Rc::ptr_eq(a, b),
            (JsValue::Object(a), JsValue::Object(b)) => Rc::ptr_eq(a, b),
            (JsValue::Function(a), JsValue::Function(b)) => Rc::ptr_eq(a, b),
            (JsValue::RegExp(a), JsValue::RegExp(b)) => Rc::ptr_eq(a, b),
            (JsValue::Date(a), JsValue::Date(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `SameValueZero`, used by `includes`.
    pub(crate) fn same_value_zero(&self, other: &JsValue) -> bool {
        match (self, other) {
            (JsValue::Number(a), JsValue::Number(b)) if a.is_nan() && b.is_nan() => true,
            _ => self.strict_equals(other),
        }
    }

    pub(crate) fn loose_equals(&self, other: &JsValue) -> bool {
        if std::mem::discriminant(self) == std::mem::discriminant(other) {
            return self.strict_equals(other);
        }
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (JsValue::Number(a), JsValue::String(_)) => *a == other.to_number(),
            (JsValue::String(_), JsValue::Number(b)) => self.to_number() == *b,
            (JsValue::Bool(_), _) => JsValue::Number(self.to_number()).loose_equals(other),
            (_, JsValue::Bool(_)) => self.loose_equals(&JsValue::Number(other.to_number())),
            (JsValue::Array(_) | JsValue::Object(_), JsValue::String(_) | JsValue::Number(_)) => {
                JsValue::from(self.to_display_string()).loose_equals(other)
            }
            (JsValue::String(_) | JsValue::Number(_), JsValue::Array(_) | JsValue::Object(_)) => {
                self.loose_equals(&JsValue::from(other.to_display_string()))
            }
            _ => false,
        }
    }

    /// Relational comparison; `None` when either side is `NaN`.
    pub(crate) fn compare(&self, other: &JsValue) -> Option<Ordering> {
        let left = self.to_primitive();
        let right = other.to_primitive();
        if let (JsValue::String(a), JsValue::String(b)) = (&left, &right) {
            return Some(a.as_ref().cmp(b.as_ref()));
        }
        left.to_number().partial_cmp(&right.to_number())
    }

    fn to_primitive(&self) -> JsValue {
        match self {
            JsValue::Date(millis) => JsValue::Number(**millis),
            JsValue::Array(_) | JsValue::Object(_) | JsValue::Function(_) | JsValue::RegExp(_) => {
                JsValue::from(self.to_display_string())
            }
            other => other.clone(),
        }
    }

    /// Whether `+` with this operand concatenates instead of adding.
    pub(crate) fn concatenates(&self) -> bool {
        matches!(
            self,
            JsValue::String(_)
                | JsValue::Array(_)
                | JsValue::Object(_)
                | JsValue::Function(_)
                | JsValue::RegExp(_)
                | JsValue::Date(_)
        )
    }

    pub(crate) fn from_json(value: &JsonValue) -> JsValue {
        match value {
            JsonValue::Null => JsValue::Null,
            JsonValue::Bool(value) => JsValue::Bool(*value),
            JsonValue::Number(number) => JsValue::Number(number.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(text) => JsValue::from(text.as_str()),
            JsonValue::Array(items) => JsValue::new_array(items.iter().map(JsValue::from_json).collect()),
            JsonValue::Object(map) => JsValue::new_object(
                map.iter()
                    .map(|(key, value)| (key.clone(), JsValue::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// Converts to JSON following `JSON.stringify` rules; `Ok(None)` means `undefined`.
    pub(crate) fn to_json(&self) -> Result<Option<JsonValue>, CircularStructure> {
        self.to_json_at(0)
    }

    fn to_json_at(&self, depth: usize) -> Result<Option<JsonValue>, CircularStructure> {
        if depth > MAX_JSON_DEPTH {
            return Err(CircularStructure);
        }
        let json = match self {
            JsValue::Undefined | JsValue::Function(_) => return Ok(None),
            JsValue::Null => JsonValue::Null,
            JsValue::Bool(value) => JsonValue::Bool(*value),
            JsValue::Number(value) => number_to_json(*value),
            JsValue::String(text) => JsonValue::String(text.to_string()),
            JsValue::RegExp(_) => JsonValue::Object(serde_json::Map::new()),
            JsValue::Date(millis) => format_iso_date(**millis).map(JsonValue::String).unwrap_or(JsonValue::Null),
            JsValue::Array(items) => {
                let items = items.borrow();
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(item.to_json_at(depth + 1)?.unwrap_or(JsonValue::Null));
                }
                JsonValue::Array(out)
            }
            JsValue::Object(entries) => {
                let entries = entries.borrow();
                let mut out = serde_json::Map::new();
                for (key, value) in entries.iter() {
                    if let Some(json) = value.to_json_at(depth + 1)? {
                        out.insert(key.clone(), json);
                    }
                }
                JsonValue::Object(out)
            }
        };
        Ok(Some(json))
    }
}

/// Raised when a structure is too deep to convert, which in practice means it references itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CircularStructure;

fn number_to_json(value: f64) -> JsonValue {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        JsonValue::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

/// JavaScript number-to-string formatting for the common cases.
pub(crate) fn format_number(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if value == 0.0 {
        "0".to_string()
    } else {
        format!("{value}")
    }
}

/// `Date.prototype.toISOString` formatting; `None` for invalid or out-of-range dates.
pub(crate) fn format_iso_date(millis: f64) -> Option<String> {
    if !millis.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(millis as i64).map(|date| date.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Parses RFC 3339 timestamps and plain `YYYY-MM-DD` dates (UTC midnight) into epoch milliseconds.
pub(crate) fn parse_date(text: &str) -> f64 {
    let text = text.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return date.timestamp_millis() as f64;
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        && let Some(midnight) = date.and_hms_opt(0, 0, 0)
    {
        return midnight.and_utc().timestamp_millis() as f64;
    }
    f64::NAN
}

fn parse_numeric_string(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map(|value| value as f64).unwrap_or(f64::NAN);
    }
    if !trimmed
        .chars()
        .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | 'e' | 'E' | '+' | '-'))
    {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}
