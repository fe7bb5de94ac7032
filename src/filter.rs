/*!
 * @file filter.rs
 * @brief MongoDB query filter evaluation over in-memory documents
 */

use bson::{Bson, Document};

use crate::error::{CommandError, CommandResult};
use crate::value::{cmp_values, comparable, type_alias, type_number, values_equal};

/// Evaluate a filter document against a document. Unknown operators are
/// command errors; comparisons across non-comparable types are `false`.
pub fn matches(doc: &Document, filter: &Document) -> CommandResult<bool> {
    for (key, condition) in filter.iter() {
        let matched = match key.as_str() {
            "$and" => logical_and(doc, key, condition)?,
            "$or" => logical_any(doc, key, condition, false)?,
            "$nor" => logical_any(doc, key, condition, true)?,
            "$comment" => true,
            k if k.starts_with('$') => {
                return Err(CommandError::bad_value(format!(
                    "unknown top level operator: {k}"
                )))
            }
            path => match_field(doc, path, condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(key: &str, condition: &'a Bson) -> CommandResult<Vec<&'a Document>> {
    let items = condition
        .as_array()
        .ok_or_else(|| CommandError::bad_value(format!("{key} must be an array")))?;
    if items.is_empty() {
        return Err(CommandError::bad_value(format!(
            "{key} argument must be a nonempty array"
        )));
    }
    items
        .iter()
        .map(|item| {
            item.as_document().ok_or_else(|| {
                CommandError::bad_value(format!("{key} argument's entries must be objects"))
            })
        })
        .collect()
}

fn logical_and(doc: &Document, key: &str, condition: &Bson) -> CommandResult<bool> {
    for filter in sub_filters(key, condition)? {
        if !matches(doc, filter)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_any(doc: &Document, key: &str, condition: &Bson, negate: bool) -> CommandResult<bool> {
    for filter in sub_filters(key, condition)? {
        if matches(doc, filter)? {
            return Ok(!negate);
        }
    }
    Ok(negate)
}

/// Values reachable at a dotted path, with implicit single-level traversal
/// into arrays: an array field contributes both itself and its elements.
#[derive(Debug, Default)]
struct Resolved {
    values: Vec<Bson>,
    found: bool,
}

fn resolve(doc: &Document, path: &str) -> Resolved {
    let segments: Vec<&str> = path.split('.').collect();
    let mut resolved = Resolved::default();
    collect(&Bson::Document(doc.clone()), &segments, &mut resolved);
    resolved
}

fn collect(value: &Bson, segments: &[&str], out: &mut Resolved) {
    if segments.is_empty() {
        out.found = true;
        out.values.push(value.clone());
        if let Bson::Array(items) = value {
            for item in items {
                out.values.push(item.clone());
            }
        }
        return;
    }
    let segment = segments[0];
    match value {
        Bson::Document(doc) => {
            if let Some(next) = doc.get(segment) {
                collect(next, &segments[1..], out);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    collect(next, &segments[1..], out);
                }
            }
            for item in items {
                if matches!(item, Bson::Document(_)) {
                    collect(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

fn is_operator_document(doc: &Document) -> bool {
    doc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false)
}

fn match_field(doc: &Document, path: &str, condition: &Bson) -> CommandResult<bool> {
    match condition {
        Bson::Document(cond) if is_operator_document(cond) => {
            match_operators(doc, path, cond)
        }
        Bson::RegularExpression(_) => {
            let resolved = resolve(doc, path);
            match_regex(&resolved.values, condition, None)
        }
        other => Ok(match_eq(doc, path, other)),
    }
}

fn match_eq(doc: &Document, path: &str, operand: &Bson) -> bool {
    let resolved = resolve(doc, path);
    if operand == &Bson::Null && !resolved.found {
        return true;
    }
    resolved.values.iter().any(|v| values_equal(v, operand))
}

fn match_operators(doc: &Document, path: &str, cond: &Document) -> CommandResult<bool> {
    for key in cond.keys() {
        if !key.starts_with('$') {
            return Err(CommandError::bad_value(format!(
                "unknown operator: {key}"
            )));
        }
    }
    let resolved = resolve(doc, path);
    for (op, operand) in cond.iter() {
        let matched = match op.as_str() {
            "$eq" => match_eq(doc, path, operand),
            "$ne" => !match_eq(doc, path, operand),
            "$gt" => match_order(&resolved, operand, |o| o == std::cmp::Ordering::Greater),
            "$gte" => match_order(&resolved, operand, |o| o != std::cmp::Ordering::Less),
            "$lt" => match_order(&resolved, operand, |o| o == std::cmp::Ordering::Less),
            "$lte" => match_order(&resolved, operand, |o| o != std::cmp::Ordering::Greater),
            "$in" => match_in(&resolved, operand)?,
            "$nin" => !match_in(&resolved, operand)?,
            "$exists" => resolved.found == bson_truthy(operand),
            "$type" => match_type(&resolved, operand)?,
            "$not" => !match_not(doc, path, operand)?,
            "$regex" => match_regex(&resolved.values, operand, cond.get("$options"))?,
            "$options" => {
                if cond.get("$regex").is_none() {
                    return Err(CommandError::bad_value(
                        "$options needs a $regex".to_string(),
                    ));
                }
                true
            }
            other => {
                return Err(CommandError::bad_value(format!(
                    "unknown operator: {other}"
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

// Missing fields participate in range comparison as null.
fn match_order<F>(resolved: &Resolved, operand: &Bson, accept: F) -> bool
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    let null = Bson::Null;
    let candidates: Vec<&Bson> = if resolved.found {
        resolved.values.iter().collect()
    } else {
        vec![&null]
    };
    candidates
        .iter()
        .any(|v| comparable(v, operand) && accept(cmp_values(v, operand)))
}

fn match_in(resolved: &Resolved, operand: &Bson) -> CommandResult<bool> {
    let items = operand
        .as_array()
        .ok_or_else(|| CommandError::bad_value("$in needs an array"))?;
    for item in items {
        match item {
            Bson::RegularExpression(_) => {
                if match_regex(&resolved.values, item, None)? {
                    return Ok(true);
                }
            }
            Bson::Null if !resolved.found => return Ok(true),
            _ => {
                if resolved.values.iter().any(|v| values_equal(v, item)) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

fn match_type(resolved: &Resolved, operand: &Bson) -> CommandResult<bool> {
    let wanted: Vec<&Bson> = match operand {
        Bson::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    for want in wanted {
        let matched = match want {
            Bson::String(alias) => {
                if alias == "number" {
                    resolved
                        .values
                        .iter()
                        .any(|v| matches!(v, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_)))
                } else {
                    resolved.values.iter().any(|v| type_alias(v) == alias)
                }
            }
            Bson::Int32(code) => resolved.values.iter().any(|v| type_number(v) == *code),
            Bson::Int64(code) => resolved
                .values
                .iter()
                .any(|v| i64::from(type_number(v)) == *code),
            Bson::Double(code) if code.fract() == 0.0 => resolved
                .values
                .iter()
                .any(|v| f64::from(type_number(v)) == *code),
            _ => {
                return Err(CommandError::bad_value(
                    "type must be represented as a number or a string",
                ))
            }
        };
        if matched {
            return Ok(true);
        }
    }
    Ok(false)
}

fn match_not(doc: &Document, path: &str, operand: &Bson) -> CommandResult<bool> {
    match operand {
        Bson::Document(inner) if is_operator_document(inner) => {
            match_operators(doc, path, inner)
        }
        Bson::RegularExpression(_) => {
            let resolved = resolve(doc, path);
            match_regex(&resolved.values, operand, None)
        }
        _ => Err(CommandError::bad_value("$not needs a regex or a document")),
    }
}

fn match_regex(values: &[Bson], operand: &Bson, options: Option<&Bson>) -> CommandResult<bool> {
    let (pattern, mut opts) = match operand {
        Bson::String(p) => (p.clone(), String::new()),
        Bson::RegularExpression(re) => (re.pattern.clone(), re.options.clone()),
        _ => {
            return Err(CommandError::bad_value(
                "$regex has to be a string or a regular expression",
            ))
        }
    };
    if let Some(extra) = options {
        let extra = extra
            .as_str()
            .ok_or_else(|| CommandError::bad_value("$options has to be a string"))?;
        opts = extra.to_string();
    }
    let regex = compile_regex(&pattern, &opts)?;
    Ok(values.iter().any(|v| match v {
        Bson::String(s) => regex.is_match(s),
        _ => false,
    }))
}

/// Compile a MongoDB regex (pattern + option letters) into a `regex::Regex`.
pub fn compile_regex(pattern: &str, options: &str) -> CommandResult<regex::Regex> {
    let mut flags = String::new();
    for opt in options.chars() {
        match opt {
            'i' => flags.push('i'),
            'm' => flags.push('m'),
            's' => flags.push('s'),
            'x' => flags.push('x'),
            other => {
                return Err(CommandError::bad_value(format!(
                    "invalid regex option: {other}"
                )))
            }
        }
    }
    let full = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{flags}){pattern}")
    };
    regex::Regex::new(&full)
        .map_err(|e| CommandError::bad_value(format!("invalid regex: {e}")))
}

/// Loose boolean coercion used by `$exists` and option flags.
pub fn bson_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(i) => *i != 0,
        Bson::Int64(i) => *i != 0,
        Bson::Double(f) => *f != 0.0,
        Bson::Null => false,
        _ => true,
    }
}
