//! Methods available on arrays, strings, numbers, regular expressions, dates and objects.

use std::cmp::Ordering;
use std::rc::Rc;

use chrono::{DateTime, Datelike, Timelike, Utc};

use super::interpreter::{Eval, Interpreter, MAX_ARRAY_LENGTH, MAX_STRING_LENGTH, describe_value};
use super::value::{ArrayRef, JsRegExp, JsValue, format_iso_date, format_number};

pub(crate) type Method = fn(&mut Interpreter, &JsValue, Vec<JsValue>) -> Eval;

/// Resolves a builtin method for the receiver's type.
pub(crate) fn lookup(target: &JsValue, name: &str) -> Option<Method> {
    match target {
        JsValue::Array(_) => array_method(name),
        JsValue::String(_) => string_method(name),
        JsValue::Number(_) => number_method(name),
        JsValue::Bool(_) => match name {
            "toString" => Some(to_string),
            "valueOf" => Some(value_of),
            _ => None,
        },
        JsValue::RegExp(_) => regexp_method(name),
        JsValue::Date(_) => date_method(name),
        JsValue::Object(_) => match name {
            "hasOwnProperty" => Some(object_has_own_property),
            "toString" => Some(to_string),
            "valueOf" => Some(value_of),
            _ => None,
        },
        _ => None,
    }
}

fn array_method(name: &str) -> Option<Method> {
    let method: Method = match name {
        "push" => array_push,
        "pop" => array_pop,
        "shift" => array_shift,
        "unshift" => array_unshift,
        "slice" => array_slice,
        "splice" => array_splice,
        "concat" => array_concat,
        "join" => array_join,
        "toString" => array_to_string,
        "reverse" => array_reverse,
        "indexOf" => array_index_of,
        "lastIndexOf" => array_last_index_of,
        "includes" => array_includes,
        "find" => array_find,
        "findIndex" => array_find_index,
        "findLast" => array_find_last,
        "findLastIndex" => array_find_last_index,
        "filter" => array_filter,
        "map" => array_map,
        "forEach" => array_for_each,
        "some" => array_some,
        "every" => array_every,
        "reduce" => array_reduce,
        "reduceRight" => array_reduce_right,
        "sort" => array_sort,
        "flat" => array_flat,
        "flatMap" => array_flat_map,
        "fill" => array_fill,
        "at" => array_at,
        "keys" => array_keys,
        "values" => array_values,
        "entries" => array_entries,
        _ => return None,
    };
    Some(method)
}

fn string_method(name: &str) -> Option<Method> {
    let method: Method = match name {
        "charAt" => string_char_at,
        "charCodeAt" | "codePointAt" => string_char_code_at,
        "at" => string_at,
        "indexOf" => string_index_of,
        "lastIndexOf" => string_last_index_of,
        "includes" => string_includes,
        "startsWith" => string_starts_with,
        "endsWith" => string_ends_with,
        "slice" => string_slice,
        "substring" => string_substring,
        "substr" => string_substr,
        "toUpperCase" | "toLocaleUpperCase" => string_to_upper_case,
        "toLowerCase" | "toLocaleLowerCase" => string_to_lower_case,
        "trim" => string_trim,
        "trimStart" => string_trim_start,
        "trimEnd" => string_trim_end,
        "padStart" => string_pad_start,
        "padEnd" => string_pad_end,
        "repeat" => string_repeat,
        "split" => string_split,
        "replace" => string_replace,
        "replaceAll" => string_replace_all,
        "match" => string_match,
        "matchAll" => string_match_all,
        "search" => string_search,
        "concat" => string_concat,
        "localeCompare" => string_locale_compare,
        "normalize" | "toString" | "valueOf" => value_of,
        _ => return None,
    };
    Some(method)
}

fn number_method(name: &str) -> Option<Method> {
    let method: Method = match name {
        "toFixed" => number_to_fixed,
        "toPrecision" => number_to_precision,
        "toString" => number_to_string,
        "toLocaleString" => to_string,
        "valueOf" => value_of,
        _ => return None,
    };
    Some(method)
}

fn regexp_method(name: &str) -> Option<Method> {
    let method: Method = match name {
        "test" => regexp_test,
        "exec" => regexp_exec,
        "toString" => to_string,
        _ => return None,
    };
    Some(method)
}

fn date_method(name: &str) -> Option<Method> {
    let method: Method = match name {
        "getTime" | "valueOf" => date_get_time,
        "toISOString" | "toJSON" => date_to_iso_string,
        "toString" | "toUTCString" => to_string,
        "getFullYear" | "getUTCFullYear" => date_get_full_year,
        "getMonth" | "getUTCMonth" => date_get_month,
        "getDate" | "getUTCDate" => date_get_date,
        "getDay" | "getUTCDay" => date_get_day,
        "getHours" | "getUTCHours" => date_get_hours,
        "getMinutes" | "getUTCMinutes" => date_get_minutes,
        "getSeconds" | "getUTCSeconds" => date_get_seconds,
        "getMilliseconds" | "getUTCMilliseconds" => date_get_milliseconds,
        _ => return None,
    };
    Some(method)
}

// ---- argument helpers ----

pub(crate) fn arg(args: &[JsValue], index: usize) -> JsValue {
    args.get(index).cloned().unwrap_or(JsValue::Undefined)
}

/// Converts to an integer the way `ToIntegerOrInfinity` does.
pub(crate) fn to_integer(value: &JsValue) -> f64 {
    let number = value.to_number();
    if number.is_nan() { 0.0 } else { number.trunc() }
}

/// Resolves a possibly negative position against `len`, clamped to `0..=len`.
fn relative_index(value: &JsValue, len: usize, default: usize) -> usize {
    if matches!(value, JsValue::Undefined) {
        return default;
    }
    let position = to_integer(value);
    if position < 0.0 {
        (len as f64 + position).max(0.0) as usize
    } else {
        position.min(len as f64) as usize
    }
}

fn items_of(target: &JsValue) -> ArrayRef {
    match target {
        JsValue::Array(items) => Rc::clone(items),
        _ => ArrayRef::default(),
    }
}

fn text_of(target: &JsValue) -> Rc<str> {
    match target {
        JsValue::String(text) => Rc::clone(text),
        other => Rc::from(other.to_display_string()),
    }
}

fn callback(interp: &mut Interpreter, args: &[JsValue]) -> Eval {
    let callback = arg(args, 0);
    if !callback.is_function() {
        let description = describe_value(&callback);
        return interp.throw_error("TypeError", format!("{description} is not a function"));
    }
    Ok(callback)
}

/// Calls `callback(item, index, array)`; `None` once the index is past the current end.
fn call_for_element(
    interp: &mut Interpreter,
    callback: &JsValue,
    target: &JsValue,
    items: &ArrayRef,
    index: usize,
) -> Eval<Option<(JsValue, JsValue)>> {
    let Some(item) = items.borrow().get(index).cloned() else {
        return Ok(None);
    };
    let result = interp.call_function(
        callback,
        vec![item.clone(), JsValue::Number(index as f64), target.clone()],
    )?;
    Ok(Some((item, result)))
}

fn to_string(interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    interp.string(target.to_display_string())
}

fn value_of(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    Ok(target.clone())
}

fn object_has_own_property(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let key = arg(&args, 0).to_property_key();
    Ok(JsValue::Bool(match target {
        JsValue::Object(entries) => entries.borrow().contains_key(&key),
        _ => false,
    }))
}

// ---- arrays ----

fn array_push(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let items = items_of(target);
    if items.borrow().len() + args.len() > MAX_ARRAY_LENGTH {
        return interp.throw_error("RangeError", "Invalid array length");
    }
    let mut items = items.borrow_mut();
    items.extend(args);
    Ok(JsValue::Number(items.len() as f64))
}

fn array_pop(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    Ok(items_of(target).borrow_mut().pop().unwrap_or(JsValue::Undefined))
}

fn array_shift(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    let items = items_of(target);
    let mut items = items.borrow_mut();
    if items.is_empty() {
        return Ok(JsValue::Undefined);
    }
    Ok(items.remove(0))
}

fn array_unshift(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let items = items_of(target);
    if items.borrow().len() + args.len() > MAX_ARRAY_LENGTH {
        return interp.throw_error("RangeError", "Invalid array length");
    }
    let mut items = items.borrow_mut();
    items.splice(0..0, args);
    Ok(JsValue::Number(items.len() as f64))
}

fn array_slice(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let items = items_of(target);
    let slice = {
        let items = items.borrow();
        let start = relative_index(&arg(&args, 0), items.len(), 0);
        let end = relative_index(&arg(&args, 1), items.len(), items.len());
        items.get(start..end.max(start)).map(<[JsValue]>::to_vec).unwrap_or_default()
    };
    Ok(interp.array(slice))
}

fn array_splice(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let items = items_of(target);
    let len = items.borrow().len();
    let start = relative_index(&arg(&args, 0), len, 0);
    let delete_count = match args.len() {
        0 => 0,
        1 => len - start,
        _ => (to_integer(&args[1]).max(0.0) as usize).min(len - start),
    };
    let inserted = args.get(2..).map(<[JsValue]>::to_vec).unwrap_or_default();
    if len - delete_count + inserted.len() > MAX_ARRAY_LENGTH {
        return interp.throw_error("RangeError", "Invalid array length");
    }
    let removed: Vec<JsValue> = items.borrow_mut().splice(start..start + delete_count, inserted).collect();
    Ok(interp.array(removed))
}

fn array_concat(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let mut out = items_of(target).borrow().clone();
    for value in args {
        match &value {
            JsValue::Array(more) => out.extend(more.borrow().iter().cloned()),
            _ => out.push(value),
        }
        if out.len() > MAX_ARRAY_LENGTH {
            return interp.throw_error("RangeError", "Invalid array length");
        }
    }
    interp.charge(out.len())?;
    Ok(interp.array(out))
}

fn join_items(interp: &mut Interpreter, target: &JsValue, separator: &str) -> Eval {
    let items = items_of(target).borrow().clone();
    interp.charge(items.len())?;
    let mut out = String::new();
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            out.push_str(separator);
        }
        if !item.is_nullish() {
            out.push_str(&item.to_display_string());
        }
        if out.len() > MAX_STRING_LENGTH {
            return interp.throw_error("RangeError", "Invalid string length");
        }
    }
    Ok(JsValue::from(out))
}

fn array_join(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let separator = match arg(&args, 0) {
        JsValue::Undefined => ",".to_string(),
        other => other.to_display_string(),
    };
    join_items(interp, target, &separator)
}

fn array_to_string(interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    join_items(interp, target, ",")
}

fn array_reverse(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    items_of(target).borrow_mut().reverse();
    Ok(target.clone())
}

fn array_index_of(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let items = items_of(target);
    let items = items.borrow();
    let needle = arg(&args, 0);
    let from = relative_index(&arg(&args, 1), items.len(), 0);
    let position = items
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, item)| item.strict_equals(&needle))
        .map(|(index, _)| index as f64);
    Ok(JsValue::Number(position.unwrap_or(-1.0)))
}

fn array_last_index_of(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let items = items_of(target);
    let items = items.borrow();
    let needle = arg(&args, 0);
    let position = items
        .iter()
        .rposition(|item| item.strict_equals(&needle))
        .map(|index| index as f64);
    Ok(JsValue::Number(position.unwrap_or(-1.0)))
}

fn array_includes(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let needle = arg(&args, 0);
    let found = items_of(target).borrow().iter().any(|item| item.same_value_zero(&needle));
    Ok(JsValue::Bool(found))
}

/// Shared driver for `find`, `findIndex`, `findLast` and `findLastIndex`.
fn find_element(interp: &mut Interpreter, target: &JsValue, args: &[JsValue], reverse: bool) -> Eval<Option<(usize, JsValue)>> {
    let callback = callback(interp, args)?;
    let items = items_of(target);
    let len = items.borrow().len();
    let indices: Box<dyn Iterator<Item = usize>> = if reverse {
        Box::new((0..len).rev())
    } else {
        Box::new(0..len)
    };
    for index in indices {
        if let Some((item, result)) = call_for_element(interp, &callback, target, &items, index)?
            && result.truthy()
        {
            return Ok(Some((index, item)));
        }
    }
    Ok(None)
}

fn array_find(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    Ok(find_element(interp, target, &args, false)?
        .map(|(_, item)| item)
        .unwrap_or(JsValue::Undefined))
}

fn array_find_index(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let index = find_element(interp, target, &args, false)?.map(|(index, _)| index as f64);
    Ok(JsValue::Number(index.unwrap_or(-1.0)))
}

fn array_find_last(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    Ok(find_element(interp, target, &args, true)?
        .map(|(_, item)| item)
        .unwrap_or(JsValue::Undefined))
}

fn array_find_last_index(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let index = find_element(interp, target, &args, true)?.map(|(index, _)| index as f64);
    Ok(JsValue::Number(index.unwrap_or(-1.0)))
}

fn array_filter(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let callback = callback(interp, &args)?;
    let items = items_of(target);
    let len = items.borrow().len();
    let mut out = Vec::new();
    for index in 0..len {
        if let Some((item, result)) = call_for_element(interp, &callback, target, &items, index)?
            && result.truthy()
        {
            out.push(item);
        }
    }
    Ok(interp.array(out))
}

fn array_map(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let callback = callback(interp, &args)?;
    let items = items_of(target);
    let len = items.borrow().len();
    let mut out = Vec::with_capacity(len);
    for index in 0..len {
        let mapped = call_for_element(interp, &callback, target, &items, index)?
            .map(|(_, result)| result)
            .unwrap_or(JsValue::Undefined);
        out.push(mapped);
    }
    Ok(interp.array(out))
}

fn array_for_each(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let callback = callback(interp, &args)?;
    let items = items_of(target);
    let len = items.borrow().len();
    for index in 0..len {
        call_for_element(interp, &callback, target, &items, index)?;
    }
    Ok(JsValue::Undefined)
}

fn array_some(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Bool(find_element(interp, target, &args, false)?.is_some()))
}

fn array_every(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let callback = callback(interp, &args)?;
    let items = items_of(target);
    let len = items.borrow().len();
    for index in 0..len {
        if let Some((_, result)) = call_for_element(interp, &callback, target, &items, index)?
            && !result.truthy()
        {
            return Ok(JsValue::Bool(false));
        }
    }
    Ok(JsValue::Bool(true))
}

fn reduce_items(interp: &mut Interpreter, target: &JsValue, args: &[JsValue], reverse: bool) -> Eval {
    let callback = callback(interp, args)?;
    let items = items_of(target).borrow().clone();
    let mut order: Vec<usize> = (0..items.len()).collect();
    if reverse {
        order.reverse();
    }
    let mut order = order.into_iter();
    let mut accumulator = match args.get(1) {
        Some(initial) => initial.clone(),
        None => match order.next() {
            Some(first) => items[first].clone(),
            None => return interp.throw_error("TypeError", "Reduce of empty array with no initial value"),
        },
    };
    for index in order {
        accumulator = interp.call_function(
            &callback,
            vec![accumulator, items[index].clone(), JsValue::Number(index as f64), target.clone()],
        )?;
    }
    Ok(accumulator)
}

fn array_reduce(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    reduce_items(interp, target, &args, false)
}

fn array_reduce_right(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    reduce_items(interp, target, &args, true)
}

fn array_sort(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let comparator = match arg(&args, 0) {
        JsValue::Undefined => None,
        function if function.is_function() => Some(function),
        other => {
            let description = describe_value(&other);
            return interp.throw_error(
                "TypeError",
                format!("The comparison function must be either a function or undefined: {description}"),
            );
        }
    };
    let items = items_of(target);
    let snapshot = items.borrow().clone();
    let sorted = merge_sort(interp, snapshot, comparator.as_ref())?;
    *items.borrow_mut() = sorted;
    Ok(target.clone())
}

/// Stable merge sort whose comparator may fail.
fn merge_sort(interp: &mut Interpreter, mut items: Vec<JsValue>, comparator: Option<&JsValue>) -> Eval<Vec<JsValue>> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(interp, items, comparator)?;
    let right = merge_sort(interp, right, comparator)?;
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(a), Some(b)) = (left.peek().cloned(), right.peek().cloned()) {
        let next = if sort_compare(interp, comparator, &b, &a)? == Ordering::Less {
            right.next()
        } else {
            left.next()
        };
        merged.extend(next);
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

fn sort_compare(interp: &mut Interpreter, comparator: Option<&JsValue>, a: &JsValue, b: &JsValue) -> Eval<Ordering> {
    match (a, b) {
        (JsValue::Undefined, JsValue::Undefined) => return Ok(Ordering::Equal),
        (JsValue::Undefined, _) => return Ok(Ordering::Greater),
        (_, JsValue::Undefined) => return Ok(Ordering::Less),
        _ => {}
    }
    match comparator {
        Some(comparator) => {
            let result = interp.call_function(comparator, vec![a.clone(), b.clone()])?.to_number();
            Ok(result.partial_cmp(&0.0).unwrap_or(Ordering::Equal))
        }
        None => Ok(a.to_display_string().cmp(&b.to_display_string())),
    }
}

fn flatten_into(interp: &mut Interpreter, out: &mut Vec<JsValue>, items: &[JsValue], depth: f64) -> Eval<()> {
    for item in items {
        match item {
            JsValue::Array(nested) if depth >= 1.0 => {
                let nested = nested.borrow().clone();
                flatten_into(interp, out, &nested, depth - 1.0)?;
            }
            other => out.push(other.clone()),
        }
        if out.len() > MAX_ARRAY_LENGTH {
            return interp.throw_error("RangeError", "Invalid array length");
        }
    }
    interp.charge(items.len())
}

fn array_flat(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let depth = match arg(&args, 0) {
        JsValue::Undefined => 1.0,
        other => to_integer(&other),
    };
    let items = items_of(target).borrow().clone();
    let mut out = Vec::new();
    flatten_into(interp, &mut out, &items, depth.min(64.0))?;
    Ok(interp.array(out))
}

fn array_flat_map(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let mapped = array_map(interp, target, args)?;
    array_flat(interp, &mapped, Vec::new())
}

fn array_fill(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let items = items_of(target);
    let len = items.borrow().len();
    let start = relative_index(&arg(&args, 1), len, 0);
    let end = relative_index(&arg(&args, 2), len, len);
    interp.charge(end.saturating_sub(start))?;
    let value = arg(&args, 0);
    for slot in items.borrow_mut().iter_mut().take(end).skip(start) {
        *slot = value.clone();
    }
    Ok(target.clone())
}

fn array_at(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let items = items_of(target);
    let items = items.borrow();
    let position = to_integer(&arg(&args, 0));
    let index = if position < 0.0 {
        items.len() as f64 + position
    } else {
        position
    };
    if index < 0.0 {
        return Ok(JsValue::Undefined);
    }
    Ok(items.get(index as usize).cloned().unwrap_or(JsValue::Undefined))
}

fn array_keys(interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    let len = items_of(target).borrow().len();
    let keys = (0..len).map(|index| JsValue::Number(index as f64)).collect();
    Ok(interp.array(keys))
}

fn array_values(interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    let values = items_of(target).borrow().clone();
    Ok(interp.array(values))
}

fn array_entries(interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    let items = items_of(target).borrow().clone();
    let mut entries = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        entries.push(interp.array(vec![JsValue::Number(index as f64), item]));
    }
    Ok(interp.array(entries))
}

// ---- strings ----

fn chars_of(target: &JsValue) -> Vec<char> {
    text_of(target).chars().collect()
}

fn collect_chars(chars: &[char]) -> JsValue {
    JsValue::from(chars.iter().collect::<String>())
}

fn find_chars(haystack: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() {
        return (from <= haystack.len()).then_some(from);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    (from..=haystack.len() - needle.len()).find(|&start| haystack[start..start + needle.len()] == *needle)
}

fn string_char_at(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let index = to_integer(&arg(&args, 0));
    let ch = (index >= 0.0).then(|| text_of(target).chars().nth(index as usize)).flatten();
    Ok(JsValue::from(ch.map(String::from).unwrap_or_default()))
}

fn string_char_code_at(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let index = to_integer(&arg(&args, 0));
    let ch = (index >= 0.0).then(|| text_of(target).chars().nth(index as usize)).flatten();
    Ok(JsValue::Number(ch.map(|ch| f64::from(u32::from(ch))).unwrap_or(f64::NAN)))
}

fn string_at(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let chars = chars_of(target);
    let position = to_integer(&arg(&args, 0));
    let index = if position < 0.0 {
        chars.len() as f64 + position
    } else {
        position
    };
    if index < 0.0 {
        return Ok(JsValue::Undefined);
    }
    Ok(chars
        .get(index as usize)
        .map(|ch| JsValue::from(ch.to_string()))
        .unwrap_or(JsValue::Undefined))
}

fn string_index_of(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let chars = chars_of(target);
    let needle: Vec<char> = arg(&args, 0).to_display_string().chars().collect();
    let from = relative_index(&arg(&args, 1), chars.len(), 0);
    let position = find_chars(&chars, &needle, from).map(|index| index as f64);
    Ok(JsValue::Number(position.unwrap_or(-1.0)))
}

fn string_last_index_of(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let chars = chars_of(target);
    let needle: Vec<char> = arg(&args, 0).to_display_string().chars().collect();
    if needle.len() > chars.len() {
        return Ok(JsValue::Number(-1.0));
    }
    let position = (0..=chars.len() - needle.len())
        .rev()
        .find(|&start| chars[start..start + needle.len()] == *needle)
        .map(|index| index as f64);
    Ok(JsValue::Number(position.unwrap_or(-1.0)))
}

fn string_includes(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let needle = arg(&args, 0).to_display_string();
    Ok(JsValue::Bool(text_of(target).contains(needle.as_str())))
}

fn string_starts_with(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let chars = chars_of(target);
    let needle: Vec<char> = arg(&args, 0).to_display_string().chars().collect();
    let from = relative_index(&arg(&args, 1), chars.len(), 0);
    Ok(JsValue::Bool(chars[from..].starts_with(&needle)))
}

fn string_ends_with(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let chars = chars_of(target);
    let needle: Vec<char> = arg(&args, 0).to_display_string().chars().collect();
    let end = relative_index(&arg(&args, 1), chars.len(), chars.len());
    Ok(JsValue::Bool(chars[..end].ends_with(&needle)))
}

fn string_slice(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let chars = chars_of(target);
    let start = relative_index(&arg(&args, 0), chars.len(), 0);
    let end = relative_index(&arg(&args, 1), chars.len(), chars.len());
    Ok(collect_chars(chars.get(start..end.max(start)).unwrap_or_default()))
}

fn string_substring(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let chars = chars_of(target);
    let clamp = |value: &JsValue, default: usize| match value {
        JsValue::Undefined => default,
        other => to_integer(other).clamp(0.0, chars.len() as f64) as usize,
    };
    let start = clamp(&arg(&args, 0), 0);
    let end = clamp(&arg(&args, 1), chars.len());
    let (start, end) = if start > end { (end, start) } else { (start, end) };
    Ok(collect_chars(&chars[start..end]))
}

fn string_substr(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let chars = chars_of(target);
    let start = relative_index(&arg(&args, 0), chars.len(), 0);
    let length = match arg(&args, 1) {
        JsValue::Undefined => chars.len() - start,
        other => (to_integer(&other).max(0.0) as usize).min(chars.len() - start),
    };
    Ok(collect_chars(&chars[start..start + length]))
}

fn string_to_upper_case(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    Ok(JsValue::from(text_of(target).to_uppercase()))
}

fn string_to_lower_case(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    Ok(JsValue::from(text_of(target).to_lowercase()))
}

fn string_trim(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    Ok(JsValue::from(text_of(target).trim()))
}

fn string_trim_start(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    Ok(JsValue::from(text_of(target).trim_start()))
}

fn string_trim_end(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    Ok(JsValue::from(text_of(target).trim_end()))
}

fn padding(interp: &mut Interpreter, target: &JsValue, args: &[JsValue]) -> Eval<(Rc<str>, String)> {
    let text = text_of(target);
    let width = to_integer(&arg(args, 0)).max(0.0);
    if width > MAX_STRING_LENGTH as f64 {
        return interp.throw_error("RangeError", "Invalid string length");
    }
    let filler: Vec<char> = match arg(args, 1) {
        JsValue::Undefined => vec![' '],
        other => other.to_display_string().chars().collect(),
    };
    let missing = (width as usize).saturating_sub(text.chars().count());
    if filler.is_empty() || missing == 0 {
        return Ok((text, String::new()));
    }
    interp.charge(missing)?;
    Ok((text, filler.iter().cycle().take(missing).collect()))
}

fn string_pad_start(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let (text, pad) = padding(interp, target, &args)?;
    Ok(JsValue::from(format!("{pad}{text}")))
}

fn string_pad_end(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let (text, pad) = padding(interp, target, &args)?;
    Ok(JsValue::from(format!("{text}{pad}")))
}

fn string_repeat(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let text = text_of(target);
    let count = to_integer(&arg(&args, 0));
    if count < 0.0 || count.is_infinite() {
        return interp.throw_error("RangeError", format!("Invalid count value: {}", format_number(count)));
    }
    if text.len() as f64 * count > MAX_STRING_LENGTH as f64 {
        return interp.throw_error("RangeError", "Invalid string length");
    }
    interp.charge(count as usize)?;
    Ok(JsValue::from(text.repeat(count as usize)))
}

fn string_split(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let text = text_of(target);
    let limit = match arg(&args, 1) {
        JsValue::Undefined => usize::MAX,
        other => to_integer(&other).max(0.0) as usize,
    };
    let parts: Vec<JsValue> = match arg(&args, 0) {
        JsValue::Undefined => vec![JsValue::String(Rc::clone(&text))],
        JsValue::RegExp(regexp) => regexp.regex.split(&text).map(JsValue::from).collect(),
        separator => {
            let separator = separator.to_display_string();
            if separator.is_empty() {
                text.chars().map(|ch| JsValue::from(ch.to_string())).collect()
            } else {
                text.split(separator.as_str()).map(JsValue::from).collect()
            }
        }
    };
    interp.charge(parts.len())?;
    let parts = parts.into_iter().take(limit).collect();
    Ok(interp.array(parts))
}

/// One match of a search pattern: byte range plus capture groups.
struct Found {
    start: usize,
    end: usize,
    groups: Vec<Option<String>>,
    names: Vec<(String, Option<String>)>,
}

fn regex_matches(regexp: &JsRegExp, text: &str, all: bool) -> Vec<Found> {
    let names: Vec<Option<&str>> = regexp.regex.capture_names().collect();
    let mut found = Vec::new();
    for captures in regexp.regex.captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let groups = (1..captures.len())
            .map(|index| captures.get(index).map(|group| group.as_str().to_string()))
            .collect();
        let named = names
            .iter()
            .enumerate()
            .filter_map(|(index, name)| {
                name.map(|name| (name.to_string(), captures.get(index).map(|group| group.as_str().to_string())))
            })
            .collect();
        found.push(Found {
            start: whole.start(),
            end: whole.end(),
            groups,
            names: named,
        });
        if !all {
            break;
        }
    }
    found
}

fn literal_matches(text: &str, needle: &str, all: bool) -> Vec<Found> {
    let mut found: Vec<Found> = text
        .match_indices(needle)
        .map(|(start, matched)| Found {
            start,
            end: start + matched.len(),
            groups: Vec::new(),
            names: Vec::new(),
        })
        .collect();
    if !all {
        found.truncate(1);
    }
    found
}

/// Expands `$&`, `$$`, `$n` and `$<name>` in a replacement template.
fn expand_replacement(template: &str, matched: &str, found: &Found) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        if ch != '$' || index + 1 >= chars.len() {
            out.push(ch);
            index += 1;
            continue;
        }
        let next = chars[index + 1];
        match next {
            '$' => {
                out.push('$');
                index += 2;
            }
            '&' => {
                out.push_str(matched);
                index += 2;
            }
            '0'..='9' => {
                let one = next.to_digit(10).unwrap_or(0) as usize;
                let two = chars
                    .get(index + 2)
                    .and_then(|ch| ch.to_digit(10))
                    .map(|digit| one * 10 + digit as usize)
                    .filter(|group| *group >= 1 && *group <= found.groups.len());
                let (group, width) = match two {
                    Some(group) => (group, 3),
                    None => (one, 2),
                };
                if group >= 1 && group <= found.groups.len() {
                    out.push_str(found.groups[group - 1].as_deref().unwrap_or(""));
                    index += width;
                } else {
                    out.push('$');
                    index += 1;
                }
            }
            '<' => match chars[index + 2..].iter().position(|ch| *ch == '>') {
                Some(close) if !found.names.is_empty() => {
                    let name: String = chars[index + 2..index + 2 + close].iter().collect();
                    if let Some((_, value)) = found.names.iter().find(|(candidate, _)| *candidate == name) {
                        out.push_str(value.as_deref().unwrap_or(""));
                    }
                    index += close + 3;
                }
                _ => {
                    out.push('$');
                    index += 1;
                }
            },
            _ => {
                out.push('$');
                index += 1;
            }
        }
    }
    out
}

fn replace_with(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>, all: bool) -> Eval {
    let text = text_of(target);
    let found = match arg(&args, 0) {
        JsValue::RegExp(regexp) => regex_matches(&regexp, &text, all || regexp.is_global()),
        pattern => literal_matches(&text, &pattern.to_display_string(), all),
    };
    let replacement = arg(&args, 1);
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for item in &found {
        out.push_str(&text[last..item.start]);
        let matched = &text[item.start..item.end];
        if replacement.is_function() {
            let mut call_args = vec![JsValue::from(matched)];
            call_args.extend(
                item.groups
                    .iter()
                    .map(|group| group.as_deref().map(JsValue::from).unwrap_or(JsValue::Undefined)),
            );
            call_args.push(JsValue::Number(text[..item.start].chars().count() as f64));
            call_args.push(JsValue::String(Rc::clone(&text)));
            let value = interp.call_function(&replacement, call_args)?;
            out.push_str(&value.to_display_string());
        } else {
            out.push_str(&expand_replacement(&replacement.to_display_string(), matched, item));
        }
        if out.len() > MAX_STRING_LENGTH {
            return interp.throw_error("RangeError", "Invalid string length");
        }
        last = item.end;
    }
    out.push_str(&text[last..]);
    interp.charge(found.len())?;
    interp.string(out)
}

fn string_replace(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    replace_with(interp, target, args, false)
}

fn string_replace_all(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    replace_with(interp, target, args, true)
}

fn pattern_regexp(interp: &mut Interpreter, pattern: JsValue) -> Eval<Rc<JsRegExp>> {
    match pattern {
        JsValue::RegExp(regexp) => Ok(regexp),
        other => {
            let source = match other {
                JsValue::Undefined => String::new(),
                other => regex::escape(&other.to_display_string()),
            };
            match JsRegExp::new(&source, "") {
                Ok(regexp) => Ok(Rc::new(regexp)),
                Err(error) => interp.throw_error("SyntaxError", error.to_string()),
            }
        }
    }
}

fn match_array(interp: &mut Interpreter, text: &str, found: &Found) -> JsValue {
    let mut items = vec![JsValue::from(&text[found.start..found.end])];
    items.extend(
        found
            .groups
            .iter()
            .map(|group| group.as_deref().map(JsValue::from).unwrap_or(JsValue::Undefined)),
    );
    interp.array(items)
}

fn string_match(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let text = text_of(target);
    let regexp = pattern_regexp(interp, arg(&args, 0))?;
    let found = regex_matches(&regexp, &text, regexp.is_global());
    if found.is_empty() {
        return Ok(JsValue::Null);
    }
    if regexp.is_global() {
        let matches = found
            .iter()
            .map(|item| JsValue::from(&text[item.start..item.end]))
            .collect();
        return Ok(interp.array(matches));
    }
    Ok(match_array(interp, &text, &found[0]))
}

fn string_match_all(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let text = text_of(target);
    let regexp = pattern_regexp(interp, arg(&args, 0))?;
    let found = regex_matches(&regexp, &text, true);
    let matches = found.iter().map(|item| match_array(interp, &text, item)).collect();
    Ok(interp.array(matches))
}

fn string_search(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let text = text_of(target);
    let regexp = pattern_regexp(interp, arg(&args, 0))?;
    let position = regexp
        .regex
        .find(&text)
        .map(|found| text[..found.start()].chars().count() as f64);
    Ok(JsValue::Number(position.unwrap_or(-1.0)))
}

fn string_concat(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let mut out = text_of(target).to_string();
    for value in args {
        out.push_str(&value.to_display_string());
    }
    interp.string(out)
}

fn string_locale_compare(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let other = arg(&args, 0).to_display_string();
    let ordering = text_of(target).as_ref().cmp(other.as_str());
    Ok(JsValue::Number(match ordering {
        Ordering::Less => -1.0,
        Ordering::Equal => 0.0,
        Ordering::Greater => 1.0,
    }))
}

// ---- numbers ----

fn number_to_fixed(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let value = target.to_number();
    let digits = to_integer(&arg(&args, 0));
    if !(0.0..=100.0).contains(&digits) {
        return interp.throw_error("RangeError", "toFixed() digits argument must be between 0 and 100");
    }
    if !value.is_finite() || value.abs() >= 1e21 {
        return Ok(JsValue::from(format_number(value)));
    }
    let digits = digits as usize;
    let factor = 10f64.powi(digits as i32);
    let rounded = (value.abs() * factor).round() / factor;
    let sign = if value < 0.0 && rounded != 0.0 { "-" } else { "" };
    Ok(JsValue::from(format!("{sign}{rounded:.digits$}")))
}

fn number_to_precision(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let value = target.to_number();
    let precision = match arg(&args, 0) {
        JsValue::Undefined => return Ok(JsValue::from(format_number(value))),
        other => to_integer(&other),
    };
    if !(1.0..=100.0).contains(&precision) {
        return interp.throw_error("RangeError", "toPrecision() argument must be between 1 and 100");
    }
    if !value.is_finite() || value == 0.0 {
        return Ok(JsValue::from(format_number(value)));
    }
    let magnitude = value.abs().log10().floor();
    let decimals = (precision - 1.0 - magnitude).max(0.0) as usize;
    Ok(JsValue::from(format!("{value:.decimals$}")))
}

fn number_to_string(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let value = target.to_number();
    let radix = match arg(&args, 0) {
        JsValue::Undefined => 10,
        other => to_integer(&other) as i64,
    };
    if !(2..=36).contains(&radix) {
        return interp.throw_error("RangeError", "toString() radix must be between 2 and 36");
    }
    if radix == 10 || !value.is_finite() || value.fract() != 0.0 || value.abs() > 9_007_199_254_740_991.0 {
        return Ok(JsValue::from(format_number(value)));
    }
    let mut magnitude = value.abs() as u64;
    let mut digits = Vec::new();
    loop {
        let digit = (magnitude % radix as u64) as u32;
        digits.push(std::char::from_digit(digit, radix as u32).unwrap_or('0'));
        magnitude /= radix as u64;
        if magnitude == 0 {
            break;
        }
    }
    if value < 0.0 {
        digits.push('-');
    }
    Ok(JsValue::from(digits.iter().rev().collect::<String>()))
}

// ---- regular expressions ----

fn regexp_of(target: &JsValue) -> Option<Rc<JsRegExp>> {
    match target {
        JsValue::RegExp(regexp) => Some(Rc::clone(regexp)),
        _ => None,
    }
}

fn regexp_test(_interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let text = arg(&args, 0).to_display_string();
    Ok(JsValue::Bool(regexp_of(target).is_some_and(|regexp| regexp.regex.is_match(&text))))
}

fn regexp_exec(interp: &mut Interpreter, target: &JsValue, args: Vec<JsValue>) -> Eval {
    let text = arg(&args, 0).to_display_string();
    let Some(regexp) = regexp_of(target) else {
        return Ok(JsValue::Null);
    };
    match regex_matches(&regexp, &text, false).first() {
        Some(found) => Ok(match_array(interp, &text, found)),
        None => Ok(JsValue::Null),
    }
}

/// Compiles a pattern for `new RegExp(source, flags)`.
pub(crate) fn compile_regexp(interp: &mut Interpreter, source: &str, flags: &str) -> Eval {
    if let Some(flag) = flags.chars().find(|flag| !"gimsuy".contains(*flag)) {
        return interp.throw_error("SyntaxError", format!("Invalid flags supplied to RegExp constructor '{flag}'"));
    }
    match JsRegExp::new(source, flags) {
        Ok(regexp) => Ok(JsValue::RegExp(Rc::new(regexp))),
        Err(error) => interp.throw_error("SyntaxError", format!("Invalid regular expression: /{source}/: {error}")),
    }
}

// ---- dates ----

fn date_parts(target: &JsValue) -> Option<DateTime<Utc>> {
    let millis = target.to_number();
    if !millis.is_finite() {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(millis as i64)
}

fn date_field(target: &JsValue, field: fn(&DateTime<Utc>) -> u32) -> Eval {
    Ok(JsValue::Number(
        date_parts(target).map(|date| f64::from(field(&date))).unwrap_or(f64::NAN),
    ))
}

fn date_get_time(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Number(target.to_number()))
}

fn date_to_iso_string(interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    match format_iso_date(target.to_number()) {
        Some(text) => Ok(JsValue::from(text)),
        None => interp.throw_error("RangeError", "Invalid time value"),
    }
}

fn date_get_full_year(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    Ok(JsValue::Number(
        date_parts(target).map(|date| f64::from(date.year())).unwrap_or(f64::NAN),
    ))
}

fn date_get_month(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    date_field(target, |date| date.month0())
}

fn date_get_date(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    date_field(target, |date| date.day())
}

fn date_get_day(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    date_field(target, |date| date.weekday().num_days_from_sunday())
}

fn date_get_hours(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    date_field(target, |date| date.hour())
}

fn date_get_minutes(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    date_field(target, |date| date.minute())
}

fn date_get_seconds(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    date_field(target, |date| date.second())
}

fn date_get_milliseconds(_interp: &mut Interpreter, target: &JsValue, _args: Vec<JsValue>) -> Eval {
    date_field(target, |date| date.timestamp_subsec_millis())
}
