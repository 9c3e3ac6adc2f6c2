//! Global bindings: `Math`, `JSON`, `Object`, `Array`, the primitive wrappers, URI and base64
//! helpers, error constructors, `RegExp` and `Date`.
//!
//! Nothing here reaches the host: there is no clock other than `Date`, no randomness and no I/O.

use std::rc::Rc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use indexmap::IndexMap;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::interpreter::{Eval, Interpreter, MAX_ARRAY_LENGTH};
use super::methods::{arg, compile_regexp, to_integer};
use super::value::{Function, JsValue, NativeFn, parse_date};

/// Characters `encodeURIComponent` leaves alone.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Characters `encodeURI` leaves alone.
const URI: &AsciiSet = &URI_COMPONENT
    .remove(b';')
    .remove(b',')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b'#');

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn function(name: &'static str, call: NativeFn, construct: Option<NativeFn>, members: Vec<(&str, JsValue)>) -> JsValue {
    JsValue::Function(Rc::new(Function::Native {
        name,
        call,
        construct,
        members: members
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    }))
}

fn native(name: &'static str, call: NativeFn) -> JsValue {
    function(name, call, None, Vec::new())
}

pub(crate) fn globals(interp: &mut Interpreter) -> Vec<(&'static str, JsValue)> {
    let math = math_object(interp);
    let json = {
        let mut entries = IndexMap::new();
        entries.insert("stringify".to_string(), native("stringify", json_stringify));
        entries.insert("parse".to_string(), native("parse", json_parse));
        interp.object(entries)
    };
    vec![
        ("undefined", JsValue::Undefined),
        ("NaN", JsValue::Number(f64::NAN)),
        ("Infinity", JsValue::Number(f64::INFINITY)),
        ("Math", math),
        ("JSON", json),
        (
            "Object",
            function(
                "Object",
                object_call,
                Some(object_call),
                vec![
                    ("keys", native("keys", object_keys)),
                    ("values", native("values", object_values)),
                    ("entries", native("entries", object_entries)),
                    ("assign", native("assign", object_assign)),
                    ("fromEntries", native("fromEntries", object_from_entries)),
                    ("freeze", native("freeze", identity)),
                ],
            ),
        ),
        (
            "Array",
            function(
                "Array",
                array_call,
                Some(array_call),
                vec![
                    ("isArray", native("isArray", array_is_array)),
                    ("from", native("from", array_from)),
                    ("of", native("of", array_of)),
                ],
            ),
        ),
        (
            "Number",
            function(
                "Number",
                number_call,
                Some(number_call),
                vec![
                    ("isInteger", native("isInteger", number_is_integer)),
                    ("isSafeInteger", native("isSafeInteger", number_is_safe_integer)),
                    ("isFinite", native("isFinite", number_is_finite)),
                    ("isNaN", native("isNaN", number_is_nan)),
                    ("parseFloat", native("parseFloat", parse_float)),
                    ("parseInt", native("parseInt", parse_int)),
                    ("MAX_SAFE_INTEGER", JsValue::Number(MAX_SAFE_INTEGER)),
                    ("MIN_SAFE_INTEGER", JsValue::Number(-MAX_SAFE_INTEGER)),
                    ("EPSILON", JsValue::Number(f64::EPSILON)),
                    ("MAX_VALUE", JsValue::Number(f64::MAX)),
                    ("POSITIVE_INFINITY", JsValue::Number(f64::INFINITY)),
                    ("NEGATIVE_INFINITY", JsValue::Number(f64::NEG_INFINITY)),
                ],
            ),
        ),
        (
            "String",
            function(
                "String",
                string_call,
                Some(string_call),
                vec![("fromCharCode", native("fromCharCode", string_from_char_code))],
            ),
        ),
        ("Boolean", function("Boolean", boolean_call, Some(boolean_call), Vec::new())),
        ("parseInt", native("parseInt", parse_int)),
        ("parseFloat", native("parseFloat", parse_float)),
        ("isNaN", native("isNaN", global_is_nan)),
        ("isFinite", native("isFinite", global_is_finite)),
        ("encodeURIComponent", native("encodeURIComponent", encode_uri_component)),
        ("encodeURI", native("encodeURI", encode_uri)),
        ("decodeURIComponent", native("decodeURIComponent", decode_uri)),
        ("decodeURI", native("decodeURI", decode_uri)),
        ("btoa", native("btoa", btoa)),
        ("atob", native("atob", atob)),
        ("Error", function("Error", error_call, Some(error_call), Vec::new())),
        ("TypeError", function("TypeError", type_error_call, Some(type_error_call), Vec::new())),
        ("RangeError", function("RangeError", range_error_call, Some(range_error_call), Vec::new())),
        ("SyntaxError", function("SyntaxError", syntax_error_call, Some(syntax_error_call), Vec::new())),
        ("RegExp", function("RegExp", regexp_call, Some(regexp_call), Vec::new())),
        (
            "Date",
            function(
                "Date",
                date_call,
                Some(date_construct),
                vec![("now", native("now", date_now)), ("parse", native("parse", date_parse))],
            ),
        ),
    ]
}

fn identity(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(arg(&args, 0))
}

// ---- Math ----

macro_rules! math_unary {
    ($($name:ident => $op:expr),* $(,)?) => {
        $(
            fn $name(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
                let op: fn(f64) -> f64 = $op;
                Ok(JsValue::Number(op(arg(&args, 0).to_number())))
            }
        )*
    };
}

math_unary! {
    math_abs => f64::abs,
    math_ceil => f64::ceil,
    math_floor => f64::floor,
    math_round => |value| (value + 0.5).floor(),
    math_trunc => f64::trunc,
    math_sign => |value| if value.is_nan() || value == 0.0 { value } else { value.signum() },
    math_sqrt => f64::sqrt,
    math_cbrt => f64::cbrt,
    math_log => f64::ln,
    math_log10 => f64::log10,
    math_log2 => f64::log2,
    math_exp => f64::exp,
    math_sin => f64::sin,
    math_cos => f64::cos,
    math_tan => f64::tan,
}

fn math_pow(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Number(arg(&args, 0).to_number().powf(arg(&args, 1).to_number())))
}

fn math_atan2(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Number(arg(&args, 0).to_number().atan2(arg(&args, 1).to_number())))
}

fn math_max(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let mut result = f64::NEG_INFINITY;
    for value in &args {
        let value = value.to_number();
        if value.is_nan() {
            return Ok(JsValue::Number(f64::NAN));
        }
        result = result.max(value);
    }
    Ok(JsValue::Number(result))
}

fn math_min(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let mut result = f64::INFINITY;
    for value in &args {
        let value = value.to_number();
        if value.is_nan() {
            return Ok(JsValue::Number(f64::NAN));
        }
        result = result.min(value);
    }
    Ok(JsValue::Number(result))
}

fn math_object(interp: &mut Interpreter) -> JsValue {
    let members: [(&'static str, NativeFn); 19] = [
        ("abs", math_abs),
        ("ceil", math_ceil),
        ("floor", math_floor),
        ("round", math_round),
        ("trunc", math_trunc),
        ("sign", math_sign),
        ("sqrt", math_sqrt),
        ("cbrt", math_cbrt),
        ("log", math_log),
        ("log10", math_log10),
        ("log2", math_log2),
        ("exp", math_exp),
        ("sin", math_sin),
        ("cos", math_cos),
        ("tan", math_tan),
        ("pow", math_pow),
        ("atan2", math_atan2),
        ("max", math_max),
        ("min", math_min),
    ];
    let mut entries: IndexMap<String, JsValue> = members
        .into_iter()
        .map(|(name, call)| (name.to_string(), native(name, call)))
        .collect();
    entries.insert("PI".to_string(), JsValue::Number(std::f64::consts::PI));
    entries.insert("E".to_string(), JsValue::Number(std::f64::consts::E));
    interp.object(entries)
}

// ---- JSON ----

fn json_stringify(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let json = match arg(&args, 0).to_json() {
        Ok(Some(json)) => json,
        Ok(None) => return Ok(JsValue::Undefined),
        Err(_) => return interp.throw_error("TypeError", "Converting circular structure to JSON"),
    };
    let indent = match arg(&args, 2) {
        JsValue::Number(width) => " ".repeat(width.clamp(0.0, 10.0) as usize),
        JsValue::String(text) => text.chars().take(10).collect(),
        _ => String::new(),
    };
    let text = if indent.is_empty() {
        serde_json::to_string(&json).map_err(|error| error.to_string())
    } else {
        let mut buffer = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
        let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
        json.serialize(&mut serializer)
            .map_err(|error| error.to_string())
            .and_then(|()| String::from_utf8(buffer).map_err(|error| error.to_string()))
    };
    match text {
        Ok(text) => interp.string(text),
        Err(message) => interp.throw_error("TypeError", message),
    }
}

fn json_parse(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let text = arg(&args, 0).to_display_string();
    match serde_json::from_str::<JsonValue>(&text) {
        Ok(json) => {
            interp.charge(text.len() / 16)?;
            Ok(interp.import_json(&json))
        }
        Err(error) => interp.throw_error("SyntaxError", format!("JSON.parse: {error}")),
    }
}

// ---- Object ----

fn object_call(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    match arg(&args, 0) {
        value @ (JsValue::Object(_) | JsValue::Array(_)) => Ok(value),
        _ => Ok(interp.object(IndexMap::new())),
    }
}

/// Own enumerable entries of objects, arrays and strings.
fn own_entries(interp: &mut Interpreter, value: &JsValue) -> Eval<Vec<(String, JsValue)>> {
    match value {
        JsValue::Undefined | JsValue::Null => {
            interp.throw_error("TypeError", "Cannot convert undefined or null to object")
        }
        JsValue::Object(entries) => Ok(entries
            .borrow()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()),
        JsValue::Array(items) => Ok(items
            .borrow()
            .iter()
            .enumerate()
            .map(|(index, value)| (index.to_string(), value.clone()))
            .collect()),
        JsValue::String(text) => Ok(text
            .chars()
            .enumerate()
            .map(|(index, ch)| (index.to_string(), JsValue::from(ch.to_string())))
            .collect()),
        _ => Ok(Vec::new()),
    }
}

fn object_keys(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let keys = own_entries(interp, &arg(&args, 0))?
        .into_iter()
        .map(|(key, _)| JsValue::from(key))
        .collect();
    Ok(interp.array(keys))
}

fn object_values(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let values = own_entries(interp, &arg(&args, 0))?
        .into_iter()
        .map(|(_, value)| value)
        .collect();
    Ok(interp.array(values))
}

fn object_entries(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let entries = own_entries(interp, &arg(&args, 0))?;
    let mut pairs = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        pairs.push(interp.array(vec![JsValue::from(key), value]));
    }
    Ok(interp.array(pairs))
}

fn object_assign(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let target = arg(&args, 0);
    if target.is_nullish() {
        return interp.throw_error("TypeError", "Cannot convert undefined or null to object");
    }
    for source in args.iter().skip(1) {
        if source.is_nullish() {
            continue;
        }
        for (key, value) in own_entries(interp, source)? {
            interp.set_property(&target, &key, value)?;
        }
    }
    Ok(target)
}

fn object_from_entries(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let pairs = interp.iterate(&arg(&args, 0))?;
    let mut entries = IndexMap::with_capacity(pairs.len());
    for pair in pairs {
        let key = interp.get_property(&pair, "0")?.to_property_key();
        let value = interp.get_property(&pair, "1")?;
        entries.insert(key, value);
    }
    Ok(interp.object(entries))
}

// ---- Array ----

fn array_call(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    if let [JsValue::Number(length)] = args.as_slice() {
        let length = *length;
        if length < 0.0 || length.fract() != 0.0 || length > MAX_ARRAY_LENGTH as f64 {
            return interp.throw_error("RangeError", "Invalid array length");
        }
        interp.charge(length as usize)?;
        return Ok(interp.array(vec![JsValue::Undefined; length as usize]));
    }
    Ok(interp.array(args))
}

fn array_is_array(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Bool(matches!(arg(&args, 0), JsValue::Array(_))))
}

fn array_from(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let source = arg(&args, 0);
    let items = match &source {
        JsValue::Array(_) | JsValue::String(_) => interp.iterate(&source)?,
        JsValue::Object(_) => {
            let length = to_integer(&interp.get_property(&source, "length")?).max(0.0);
            if length > MAX_ARRAY_LENGTH as f64 {
                return interp.throw_error("RangeError", "Invalid array length");
            }
            interp.charge(length as usize)?;
            let mut items = Vec::with_capacity(length as usize);
            for index in 0..length as usize {
                items.push(interp.get_property(&source, &index.to_string())?);
            }
            items
        }
        JsValue::Undefined | JsValue::Null => {
            return interp.throw_error("TypeError", "Array.from requires an array-like object");
        }
        _ => Vec::new(),
    };
    let mapper = arg(&args, 1);
    if !mapper.is_function() {
        return Ok(interp.array(items));
    }
    let mut mapped = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        mapped.push(interp.call_function(&mapper, vec![item, JsValue::Number(index as f64)])?);
    }
    Ok(interp.array(mapped))
}

fn array_of(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(interp.array(args))
}

// ---- primitive wrappers ----

fn number_call(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Number(args.first().map(JsValue::to_number).unwrap_or(0.0)))
}

fn number_is_integer(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Bool(
        matches!(arg(&args, 0), JsValue::Number(value) if value.is_finite() && value.fract() == 0.0),
    ))
}

fn number_is_safe_integer(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Bool(matches!(
        arg(&args, 0),
        JsValue::Number(value) if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER
    )))
}

fn number_is_finite(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Bool(matches!(arg(&args, 0), JsValue::Number(value) if value.is_finite())))
}

fn number_is_nan(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Bool(matches!(arg(&args, 0), JsValue::Number(value) if value.is_nan())))
}

fn global_is_nan(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Bool(arg(&args, 0).to_number().is_nan()))
}

fn global_is_finite(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Bool(arg(&args, 0).to_number().is_finite()))
}

fn string_call(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    match args.first() {
        Some(value) => interp.string(value.to_display_string()),
        None => Ok(JsValue::from("")),
    }
}

fn string_from_char_code(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let text: String = args
        .iter()
        .map(|code| char::from_u32(to_integer(code) as u32 & 0xFFFF).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    Ok(JsValue::from(text))
}

fn boolean_call(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Bool(arg(&args, 0).truthy()))
}

fn parse_int(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let text = arg(&args, 0).to_display_string();
    let mut rest = text.trim_start();
    let negative = rest.starts_with('-');
    if negative || rest.starts_with('+') {
        rest = &rest[1..];
    }
    let mut radix = match arg(&args, 1) {
        JsValue::Undefined => 0,
        other => to_integer(&other) as u32,
    };
    let has_hex_prefix = rest.starts_with("0x") || rest.starts_with("0X");
    if radix == 0 {
        radix = if has_hex_prefix { 16 } else { 10 };
    }
    if radix == 16 && has_hex_prefix {
        rest = &rest[2..];
    }
    if !(2..=36).contains(&radix) {
        return Ok(JsValue::Number(f64::NAN));
    }
    let mut value = 0f64;
    let mut seen = false;
    for ch in rest.chars() {
        let Some(digit) = ch.to_digit(radix) else {
            break;
        };
        value = value * f64::from(radix) + f64::from(digit);
        seen = true;
    }
    if !seen {
        return Ok(JsValue::Number(f64::NAN));
    }
    Ok(JsValue::Number(if negative { -value } else { value }))
}

/// Length of the longest prefix of `text` that reads as a decimal literal.
fn float_prefix_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut index = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        index += 1;
    }
    if text[index..].starts_with("Infinity") {
        return index + "Infinity".len();
    }
    let digits = |from: usize| bytes[from..].iter().take_while(|b| b.is_ascii_digit()).count();
    let integer = digits(index);
    index += integer;
    let mut fraction = 0;
    if bytes.get(index) == Some(&b'.') {
        fraction = digits(index + 1);
        if integer > 0 || fraction > 0 {
            index += 1 + fraction;
        }
    }
    if integer == 0 && fraction == 0 {
        return 0;
    }
    if matches!(bytes.get(index), Some(b'e' | b'E')) {
        let mut exponent = index + 1;
        if matches!(bytes.get(exponent), Some(b'+' | b'-')) {
            exponent += 1;
        }
        let exponent_digits = digits(exponent);
        if exponent_digits > 0 {
            index = exponent + exponent_digits;
        }
    }
    index
}

fn parse_float(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let text = arg(&args, 0).to_display_string();
    let text = text.trim_start();
    let prefix = &text[..float_prefix_len(text)];
    let value = match prefix.trim_start_matches(['+', '-']) {
        "" => f64::NAN,
        "Infinity" => {
            if prefix.starts_with('-') {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            }
        }
        _ => prefix.parse().unwrap_or(f64::NAN),
    };
    Ok(JsValue::Number(value))
}

// ---- URI and base64 ----

fn encode_uri_component(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let text = arg(&args, 0).to_display_string();
    interp.string(utf8_percent_encode(&text, URI_COMPONENT).to_string())
}

fn encode_uri(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let text = arg(&args, 0).to_display_string();
    interp.string(utf8_percent_encode(&text, URI).to_string())
}

fn decode_uri(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let text = arg(&args, 0).to_display_string();
    match percent_decode_str(&text).decode_utf8() {
        Ok(decoded) => Ok(JsValue::from(decoded.into_owned())),
        Err(_) => interp.throw_error("URIError", "URI malformed"),
    }
}

fn btoa(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let text = arg(&args, 0).to_display_string();
    let mut bytes = Vec::with_capacity(text.len());
    for ch in text.chars() {
        match u8::try_from(u32::from(ch)) {
            Ok(byte) => bytes.push(byte),
            Err(_) => {
                return interp.throw_error(
                    "InvalidCharacterError",
                    "The string to be encoded contains characters outside of the Latin1 range.",
                );
            }
        }
    }
    interp.string(STANDARD.encode(bytes))
}

fn atob(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let text: String = arg(&args, 0)
        .to_display_string()
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    match STANDARD_NO_PAD.decode(text.trim_end_matches('=')) {
        Ok(bytes) => Ok(JsValue::from(bytes.into_iter().map(char::from).collect::<String>())),
        Err(_) => interp.throw_error("InvalidCharacterError", "The string to be decoded is not correctly encoded."),
    }
}

// ---- errors, RegExp, Date ----

fn make_error(interp: &mut Interpreter, name: &str, args: &[JsValue]) -> Eval {
    let message = match arg(args, 0) {
        JsValue::Undefined => String::new(),
        other => other.to_display_string(),
    };
    Ok(interp.error_value(name, message))
}

fn error_call(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    make_error(interp, "Error", &args)
}

fn type_error_call(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    make_error(interp, "TypeError", &args)
}

fn range_error_call(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    make_error(interp, "RangeError", &args)
}

fn syntax_error_call(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    make_error(interp, "SyntaxError", &args)
}

fn regexp_call(interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let (source, default_flags) = match arg(&args, 0) {
        JsValue::RegExp(regexp) => (regexp.source.clone(), regexp.flags.clone()),
        JsValue::Undefined => ("(?:)".to_string(), String::new()),
        other => (other.to_display_string(), String::new()),
    };
    let flags = match arg(&args, 1) {
        JsValue::Undefined => default_flags,
        other => other.to_display_string(),
    };
    compile_regexp(interp, &source, &flags)
}

fn now_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

fn date_call(interp: &mut Interpreter, _args: Vec<JsValue>) -> Eval {
    interp.string(JsValue::Date(Rc::new(now_millis())).to_display_string())
}

fn date_construct(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    let millis = match args.first() {
        None => now_millis(),
        Some(JsValue::String(text)) => parse_date(text),
        Some(JsValue::Date(millis)) => **millis,
        Some(other) => other.to_number(),
    };
    let millis = if millis.is_finite() { millis.trunc() } else { f64::NAN };
    Ok(JsValue::Date(Rc::new(millis)))
}

fn date_now(_interp: &mut Interpreter, _args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Number(now_millis()))
}

fn date_parse(_interp: &mut Interpreter, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Number(parse_date(&arg(&args, 0).to_display_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_prefix_stops_at_first_invalid_character() {
        assert_eq!(float_prefix_len("3.14abc"), 4);
        assert_eq!(float_prefix_len("-2e3x"), 4);
        assert_eq!(float_prefix_len("1e"), 1);
        assert_eq!(float_prefix_len(".5"), 2);
        assert_eq!(float_prefix_len("abc"), 0);
        assert_eq!(float_prefix_len("-Infinityx"), 9);
    }
}
