//! Minimal JSON navigation and stringification helpers.

use serde_json::Value;

/// One step of a cursor path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Field(&'a str),
    Index(usize),
}

/// Splits `meta.pages[0].next` into fields and array indices. A leading `$` root marker is
/// accepted; malformed brackets yield `None`.
fn segments(path: &str) -> Option<Vec<Segment<'_>>> {
    let path = path.trim();
    let path = path.strip_prefix('$').unwrap_or(path);
    let mut parsed = Vec::new();
    for part in path.split('.').filter(|part| !part.is_empty()) {
        let (field, mut rest) = part.split_at(part.find('[').unwrap_or(part.len()));
        if !field.is_empty() {
            parsed.push(Segment::Field(field));
        }
        while let Some(open) = rest.strip_prefix('[') {
            let (index, tail) = open.split_once(']')?;
            parsed.push(Segment::Index(index.trim().parse().ok()?));
            rest = tail;
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(parsed)
}

/// Looks up the value at a dotted path such as `meta.pages[0].next` or `$.cursor`.
///
/// A blank path selects `value` itself. Missing members, out-of-range indices and indexing into
/// the wrong JSON type all yield `None`.
pub fn select_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    segments(path)?.into_iter().try_fold(value, |current, segment| match segment {
        Segment::Field(field) => current.as_object()?.get(field),
        Segment::Index(index) => current.as_array()?.get(index),
    })
}

/// String form of a JSON value used when substituting into string fields.
///
/// Strings are returned verbatim, scalars via their JSON text and structured values as
/// compact JSON.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
