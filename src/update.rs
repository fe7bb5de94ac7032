/*!
 * @file update.rs
 * @brief Update operator evaluation: $set family, arithmetic, array operators
 */

use bson::{doc, Bson, Document, Timestamp};

use crate::error::{CommandError, CommandResult, ErrorCode};
use crate::filter;
use crate::sort::sort_documents;
use crate::value::{cmp_values, values_equal};

const FIELD_OPERATORS: &[&str] = &[
    "$set",
    "$unset",
    "$inc",
    "$mul",
    "$min",
    "$max",
    "$rename",
    "$currentDate",
    "$push",
    "$addToSet",
    "$pop",
    "$pull",
    "$pullAll",
];

/// Outcome of applying an update to a single document.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub document: Document,
    pub modified: bool,
}

/// True when the update document is an operator update rather than a
/// replacement document.
pub fn is_operator_update(update: &Document) -> CommandResult<bool> {
    let mut saw_operator = false;
    let mut saw_field = false;
    for key in update.keys() {
        if key.starts_with('$') {
            saw_operator = true;
        } else {
            saw_field = true;
        }
    }
    if saw_operator && saw_field {
        return Err(CommandError::new(
            ErrorCode::FailedToParse,
            "update document cannot mix operator and non-operator fields",
        ));
    }
    Ok(saw_operator)
}

/// Apply an update (operator document or replacement) to `original`. The
/// whole request is validated before any field is touched.
pub fn apply_update(original: &Document, update: &Document) -> CommandResult<UpdateOutcome> {
    if is_operator_update(update)? {
        apply_operators(original, update)
    } else {
        apply_replacement(original, update)
    }
}

fn apply_replacement(original: &Document, replacement: &Document) -> CommandResult<UpdateOutcome> {
    let original_id = original.get("_id");
    if let (Some(old), Some(new)) = (original_id, replacement.get("_id")) {
        if !values_equal(old, new) {
            return Err(CommandError::bad_value(
                "the _id field cannot be changed by an update",
            ));
        }
    }
    let mut document = Document::new();
    // `_id` stays first regardless of the replacement's layout.
    if let Some(id) = original_id {
        document.insert("_id", id.clone());
    }
    for (key, value) in replacement.iter() {
        if key == "_id" {
            continue;
        }
        document.insert(key.clone(), value.clone());
    }
    let modified = &document != original;
    Ok(UpdateOutcome { document, modified })
}

fn apply_operators(original: &Document, update: &Document) -> CommandResult<UpdateOutcome> {
    validate_operators(update)?;
    let mut document = original.clone();
    for (op, operand) in update.iter() {
        let fields = operand.as_document().expect("validated above");
        for (path, argument) in fields.iter() {
            apply_one(&mut document, op, path, argument)?;
        }
    }
    if let (Some(old), Some(new)) = (original.get("_id"), document.get("_id")) {
        if !values_equal(old, new) {
            return Err(CommandError::bad_value(
                "the _id field cannot be changed by an update",
            ));
        }
    }
    let modified = &document != original;
    Ok(UpdateOutcome { document, modified })
}

fn validate_operators(update: &Document) -> CommandResult<()> {
    let mut touched: Vec<String> = Vec::new();
    for (op, operand) in update.iter() {
        if !FIELD_OPERATORS.contains(&op.as_str()) {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                format!("Unknown modifier: {op}"),
            ));
        }
        let fields = operand.as_document().ok_or_else(|| {
            CommandError::new(
                ErrorCode::FailedToParse,
                format!(
                    "Modifiers operate on fields but we found type {} instead",
                    crate::value::type_alias(operand)
                ),
            )
        })?;
        if fields.is_empty() {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                format!("'{op}' is empty. You must specify a field like so: {{{op}: {{<field>: ...}}}}"),
            ));
        }
        for (path, argument) in fields.iter() {
            validate_path(path)?;
            touched.push(path.clone());
            if op == "$rename" {
                let target = argument.as_str().ok_or_else(|| {
                    CommandError::bad_value("The 'to' field for $rename must be a string")
                })?;
                validate_path(target)?;
                touched.push(target.to_string());
            }
        }
    }
    for i in 0..touched.len() {
        for j in (i + 1)..touched.len() {
            if paths_conflict(&touched[i], &touched[j]) {
                return Err(CommandError::new(
                    ErrorCode::ConflictingUpdateOperators,
                    format!(
                        "Updating the path '{}' would create a conflict at '{}'",
                        touched[j], touched[i]
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn validate_path(path: &str) -> CommandResult<()> {
    if path.is_empty() || path.split('.').any(|segment| segment.is_empty()) {
        return Err(CommandError::bad_value(format!(
            "The update path '{path}' contains an empty field name"
        )));
    }
    Ok(())
}

fn paths_conflict(a: &str, b: &str) -> bool {
    a == b
        || a.strip_prefix(b).map(|rest| rest.starts_with('.')).unwrap_or(false)
        || b.strip_prefix(a).map(|rest| rest.starts_with('.')).unwrap_or(false)
}

fn apply_one(document: &mut Document, op: &str, path: &str, argument: &Bson) -> CommandResult<()> {
    match op {
        "$set" => set_path(document, path, argument.clone()),
        "$unset" => {
            unset_path(document, path);
            Ok(())
        }
        "$inc" => arithmetic(document, path, argument, "$inc"),
        "$mul" => arithmetic(document, path, argument, "$mul"),
        "$min" => min_max(document, path, argument, true),
        "$max" => min_max(document, path, argument, false),
        "$rename" => rename(document, path, argument),
        "$currentDate" => current_date(document, path, argument),
        "$push" => push(document, path, argument),
        "$addToSet" => add_to_set(document, path, argument),
        "$pop" => pop(document, path, argument),
        "$pull" => pull(document, path, argument),
        "$pullAll" => pull_all(document, path, argument),
        _ => unreachable!("validated operator"),
    }
}

// Direct dotted-path read; documents and array indices only.
fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = document.get(first)?;
    for segment in segments {
        current = match current {
            Bson::Document(d) => d.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn set_path(document: &mut Document, path: &str, value: Bson) -> CommandResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    set_in_document(document, &segments, value, path)
}

fn set_in_document(
    document: &mut Document,
    segments: &[&str],
    value: Bson,
    full_path: &str,
) -> CommandResult<()> {
    let segment = segments[0];
    if segments.len() == 1 {
        document.insert(segment.to_string(), value);
        return Ok(());
    }
    if document.get(segment).is_none() {
        document.insert(segment.to_string(), Bson::Document(Document::new()));
    }
    let next = document.get_mut(segment).expect("just inserted");
    set_in_value(next, &segments[1..], value, full_path)
}

fn set_in_value(
    target: &mut Bson,
    segments: &[&str],
    value: Bson,
    full_path: &str,
) -> CommandResult<()> {
    let segment = segments[0];
    match target {
        Bson::Document(d) => set_in_document(d, segments, value, full_path),
        Bson::Array(items) => {
            let index = segment.parse::<usize>().map_err(|_| {
                CommandError::bad_value(format!(
                    "Cannot create field '{segment}' in element of array at '{full_path}'"
                ))
            })?;
            while items.len() <= index {
                items.push(Bson::Null);
            }
            if segments.len() == 1 {
                items[index] = value;
                return Ok(());
            }
            if matches!(items[index], Bson::Null) {
                items[index] = Bson::Document(Document::new());
            }
            set_in_value(&mut items[index], &segments[1..], value, full_path)
        }
        _ => Err(CommandError::bad_value(format!(
            "Cannot create field '{segment}' in '{full_path}'"
        ))),
    }
}

// $unset removes document fields but leaves a null hole in arrays.
fn unset_path(document: &mut Document, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    unset_in_document(document, &segments);
}

fn unset_in_document(document: &mut Document, segments: &[&str]) {
    let segment = segments[0];
    if segments.len() == 1 {
        document.remove(segment);
        return;
    }
    if let Some(next) = document.get_mut(segment) {
        unset_in_value(next, &segments[1..]);
    }
}

fn unset_in_value(target: &mut Bson, segments: &[&str]) {
    match target {
        Bson::Document(d) => unset_in_document(d, segments),
        Bson::Array(items) => {
            let Ok(index) = segments[0].parse::<usize>() else {
                return;
            };
            if segments.len() == 1 {
                if index < items.len() {
                    items[index] = Bson::Null;
                }
                return;
            }
            if let Some(next) = items.get_mut(index) {
                unset_in_value(next, &segments[1..]);
            }
        }
        _ => {}
    }
}

#[derive(Clone, Copy)]
enum Num {
    I32(i32),
    I64(i64),
    F64(f64),
    Dec(f64),
}

fn to_num(value: &Bson) -> Option<Num> {
    match value {
        Bson::Int32(i) => Some(Num::I32(*i)),
        Bson::Int64(i) => Some(Num::I64(*i)),
        Bson::Double(f) => Some(Num::F64(*f)),
        Bson::Decimal128(d) => d.to_string().parse::<f64>().ok().map(Num::Dec),
        _ => None,
    }
}

fn num_to_bson(num: Num) -> CommandResult<Bson> {
    Ok(match num {
        Num::I32(i) => Bson::Int32(i),
        Num::I64(i) => Bson::Int64(i),
        Num::F64(f) => Bson::Double(f),
        Num::Dec(f) => {
            let text = format!("{}", f);
            let parsed = text.parse::<bson::Decimal128>().map_err(|e| {
                CommandError::internal(format!("decimal conversion failed: {e}"))
            })?;
            Bson::Decimal128(parsed)
        }
    })
}

fn num_combine(a: Num, b: Num, multiply: bool) -> CommandResult<Num> {
    let overflow =
        || CommandError::bad_value("integer overflow in update arithmetic".to_string());
    Ok(match (a, b) {
        (Num::Dec(x), other) | (other, Num::Dec(x)) => {
            let y = match other {
                Num::I32(i) => f64::from(i),
                Num::I64(i) => i as f64,
                Num::F64(f) => f,
                Num::Dec(f) => f,
            };
            Num::Dec(if multiply { x * y } else { x + y })
        }
        (Num::F64(x), other) | (other, Num::F64(x)) => {
            let y = match other {
                Num::I32(i) => f64::from(i),
                Num::I64(i) => i as f64,
                Num::F64(f) => f,
                Num::Dec(f) => f,
            };
            Num::F64(if multiply { x * y } else { x + y })
        }
        (Num::I64(x), other) | (other, Num::I64(x)) => {
            let y = match other {
                Num::I32(i) => i64::from(i),
                Num::I64(i) => i,
                _ => unreachable!(),
            };
            let combined = if multiply {
                x.checked_mul(y)
            } else {
                x.checked_add(y)
            };
            Num::I64(combined.ok_or_else(overflow)?)
        }
        (Num::I32(x), Num::I32(y)) => {
            // int32 arithmetic that overflows promotes to int64.
            let combined = if multiply {
                x.checked_mul(y)
            } else {
                x.checked_add(y)
            };
            match combined {
                Some(v) => Num::I32(v),
                None => {
                    let wide = if multiply {
                        i64::from(x).checked_mul(i64::from(y))
                    } else {
                        i64::from(x).checked_add(i64::from(y))
                    };
                    Num::I64(wide.ok_or_else(overflow)?)
                }
            }
        }
    })
}

fn arithmetic(document: &mut Document, path: &str, argument: &Bson, op: &str) -> CommandResult<()> {
    let operand = to_num(argument).ok_or_else(|| {
        CommandError::type_mismatch(format!(
            "Cannot {op} with non-numeric argument: {{{path}: {argument}}}"
        ))
    })?;
    let current = match get_path(document, path) {
        None => {
            // $inc seeds with the operand, $mul with a zero of its type.
            let seeded = if op == "$inc" {
                operand
            } else {
                match operand {
                    Num::I32(_) => Num::I32(0),
                    Num::I64(_) => Num::I64(0),
                    Num::F64(_) => Num::F64(0.0),
                    Num::Dec(_) => Num::Dec(0.0),
                }
            };
            return set_path(document, path, num_to_bson(seeded)?);
        }
        Some(value) => to_num(value).ok_or_else(|| {
            CommandError::type_mismatch(format!(
                "Cannot apply {op} to a value of non-numeric type: {{{path}: {value}}}"
            ))
        })?,
    };
    let combined = num_combine(current, operand, op == "$mul")?;
    set_path(document, path, num_to_bson(combined)?)
}

fn min_max(document: &mut Document, path: &str, argument: &Bson, take_min: bool) -> CommandResult<()> {
    match get_path(document, path) {
        None => set_path(document, path, argument.clone()),
        Some(current) => {
            let ordering = cmp_values(argument, current);
            let replace = if take_min {
                ordering == std::cmp::Ordering::Less
            } else {
                ordering == std::cmp::Ordering::Greater
            };
            if replace {
                set_path(document, path, argument.clone())
            } else {
                Ok(())
            }
        }
    }
}

fn rename(document: &mut Document, path: &str, argument: &Bson) -> CommandResult<()> {
    let target = argument.as_str().expect("validated");
    if path == target {
        return Err(CommandError::bad_value(format!(
            "The source and target field for $rename must differ: {path}"
        )));
    }
    if get_path(document, path).is_none() {
        return Ok(());
    }
    let segments: Vec<&str> = path.split('.').collect();
    let value = take_path(document, &segments).ok_or_else(|| {
        CommandError::bad_value(format!(
            "The source field for $rename must not be an array element: {path}"
        ))
    })?;
    set_path(document, target, value)
}

// Remove-and-return, documents only; renaming through arrays is an error.
fn take_path(document: &mut Document, segments: &[&str]) -> Option<Bson> {
    let segment = segments[0];
    if segments.len() == 1 {
        return document.remove(segment);
    }
    match document.get_mut(segment)? {
        Bson::Document(inner) => take_path(inner, &segments[1..]),
        _ => None,
    }
}

fn current_date(document: &mut Document, path: &str, argument: &Bson) -> CommandResult<()> {
    let value = match argument {
        Bson::Boolean(_) => Bson::DateTime(bson::DateTime::now()),
        Bson::Document(spec) => match spec.get_str("$type") {
            Ok("date") => Bson::DateTime(bson::DateTime::now()),
            Ok("timestamp") => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as u32;
                Bson::Timestamp(Timestamp {
                    time: now,
                    increment: 1,
                })
            }
            _ => {
                return Err(CommandError::bad_value(
                    "$currentDate type must be 'date' or 'timestamp'",
                ))
            }
        },
        _ => {
            return Err(CommandError::bad_value(
                "$currentDate needs a boolean or a $type specification",
            ))
        }
    };
    set_path(document, path, value)
}

fn array_at<'a>(
    document: &'a mut Document,
    path: &str,
) -> CommandResult<Option<&'a mut Vec<Bson>>> {
    match get_path(document, path) {
        None => Ok(None),
        Some(Bson::Array(_)) => {
            let segments: Vec<&str> = path.split('.').collect();
            get_array_mut(document, &segments)
                .map(Some)
                .ok_or_else(|| {
                    CommandError::bad_value(format!("cannot address array at '{path}'"))
                })
        }
        Some(other) => Err(CommandError::type_mismatch(format!(
            "The field '{path}' must be an array but is of type {} in document",
            crate::value::type_alias(other)
        ))),
    }
}

fn get_array_mut<'a>(document: &'a mut Document, segments: &[&str]) -> Option<&'a mut Vec<Bson>> {
    let segment = segments[0];
    if segments.len() == 1 {
        return match document.get_mut(segment)? {
            Bson::Array(items) => Some(items),
            _ => None,
        };
    }
    match document.get_mut(segment)? {
        Bson::Document(inner) => get_array_mut(inner, &segments[1..]),
        Bson::Array(items) => {
            let index = segments[1].parse::<usize>().ok()?;
            if segments.len() == 2 {
                match items.get_mut(index)? {
                    Bson::Array(inner) => Some(inner),
                    _ => None,
                }
            } else {
                match items.get_mut(index)? {
                    Bson::Document(inner) => get_array_mut(inner, &segments[2..]),
                    _ => None,
                }
            }
        }
        _ => None,
    }
}

struct PushSpec {
    values: Vec<Bson>,
    position: Option<i64>,
    slice: Option<i64>,
    sort: Option<Bson>,
}

fn parse_push_spec(argument: &Bson, op: &str) -> CommandResult<PushSpec> {
    if let Bson::Document(spec) = argument {
        if spec.keys().any(|k| k.starts_with('$')) {
            let mut values = None;
            let mut position = None;
            let mut slice = None;
            let mut sort = None;
            for (key, modifier) in spec.iter() {
                match key.as_str() {
                    "$each" => {
                        let items = modifier.as_array().ok_or_else(|| {
                            CommandError::bad_value(format!("The argument to $each in {op} must be an array"))
                        })?;
                        values = Some(items.clone());
                    }
                    "$position" if op == "$push" => {
                        position = Some(modifier_int(modifier, "$position")?);
                    }
                    "$slice" if op == "$push" => {
                        slice = Some(modifier_int(modifier, "$slice")?);
                    }
                    "$sort" if op == "$push" => {
                        sort = Some(modifier.clone());
                    }
                    other => {
                        return Err(CommandError::bad_value(format!(
                            "Unrecognized clause in {op}: {other}"
                        )))
                    }
                }
            }
            let values = values.ok_or_else(|| {
                CommandError::bad_value(format!("{op} modifiers require $each"))
            })?;
            return Ok(PushSpec {
                values,
                position,
                slice,
                sort,
            });
        }
    }
    Ok(PushSpec {
        values: vec![argument.clone()],
        position: None,
        slice: None,
        sort: None,
    })
}

fn modifier_int(value: &Bson, name: &str) -> CommandResult<i64> {
    match value {
        Bson::Int32(i) => Ok(i64::from(*i)),
        Bson::Int64(i) => Ok(*i),
        Bson::Double(f) if f.fract() == 0.0 => Ok(*f as i64),
        _ => Err(CommandError::bad_value(format!(
            "The value for {name} must be an integer"
        ))),
    }
}

fn push(document: &mut Document, path: &str, argument: &Bson) -> CommandResult<()> {
    let spec = parse_push_spec(argument, "$push")?;
    if array_at(document, path)?.is_none() {
        set_path(document, path, Bson::Array(Vec::new()))?;
    }
    let items = array_at(document, path)?.expect("array ensured by set_path");
    match spec.position {
        None => items.extend(spec.values),
        Some(pos) => {
            let len = items.len() as i64;
            let at = if pos < 0 {
                (len + pos).max(0) as usize
            } else {
                pos.min(len) as usize
            };
            for (offset, value) in spec.values.into_iter().enumerate() {
                items.insert(at + offset, value);
            }
        }
    }
    if let Some(sort_spec) = spec.sort {
        sort_pushed(items, &sort_spec)?;
    }
    if let Some(n) = spec.slice {
        let keep = n.unsigned_abs() as usize;
        if n == 0 {
            items.clear();
        } else if n > 0 {
            items.truncate(keep);
        } else if items.len() > keep {
            items.drain(..items.len() - keep);
        }
    }
    Ok(())
}

fn sort_pushed(items: &mut [Bson], sort_spec: &Bson) -> CommandResult<()> {
    match sort_spec {
        Bson::Int32(1) | Bson::Int64(1) => {
            items.sort_by(cmp_values);
            Ok(())
        }
        Bson::Int32(-1) | Bson::Int64(-1) => {
            items.sort_by(|a, b| cmp_values(b, a));
            Ok(())
        }
        Bson::Document(fields) => {
            // Field sort applies to element documents only.
            let mut docs: Vec<Document> = Vec::with_capacity(items.len());
            for item in items.iter() {
                match item {
                    Bson::Document(d) => docs.push(d.clone()),
                    _ => {
                        return Err(CommandError::bad_value(
                            "$sort by fields requires all elements to be objects",
                        ))
                    }
                }
            }
            sort_documents(&mut docs, fields)?;
            for (slot, sorted) in items.iter_mut().zip(docs.into_iter()) {
                *slot = Bson::Document(sorted);
            }
            Ok(())
        }
        _ => Err(CommandError::bad_value(
            "The $sort is invalid: use 1/-1 or a sort document",
        )),
    }
}

fn add_to_set(document: &mut Document, path: &str, argument: &Bson) -> CommandResult<()> {
    let spec = parse_push_spec(argument, "$addToSet")?;
    if array_at(document, path)?.is_none() {
        set_path(document, path, Bson::Array(Vec::new()))?;
    }
    let items = array_at(document, path)?.expect("array ensured by set_path");
    for value in spec.values {
        if !items.iter().any(|existing| values_equal(existing, &value)) {
            items.push(value);
        }
    }
    Ok(())
}

fn pop(document: &mut Document, path: &str, argument: &Bson) -> CommandResult<()> {
    let from_front = match argument {
        Bson::Int32(-1) | Bson::Int64(-1) => true,
        Bson::Int32(1) | Bson::Int64(1) => false,
        Bson::Double(f) if *f == 1.0 => false,
        Bson::Double(f) if *f == -1.0 => true,
        _ => {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                "$pop expects 1 or -1",
            ))
        }
    };
    let Some(items) = array_at(document, path)? else {
        return Ok(());
    };
    if items.is_empty() {
        return Ok(());
    }
    if from_front {
        items.remove(0);
    } else {
        items.pop();
    }
    Ok(())
}

fn pull_matches(element: &Bson, condition: &Bson) -> CommandResult<bool> {
    match condition {
        Bson::Document(cond) if cond.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) => {
            // Operator condition applies to the element itself.
            let probe = doc! { "v": element.clone() };
            filter::matches(&probe, &doc! { "v": condition.clone() })
        }
        Bson::Document(cond) => match element {
            Bson::Document(elem) => filter::matches(elem, cond),
            _ => Ok(false),
        },
        scalar => Ok(values_equal(element, scalar)),
    }
}

fn pull(document: &mut Document, path: &str, argument: &Bson) -> CommandResult<()> {
    let Some(items) = array_at(document, path)? else {
        return Ok(());
    };
    let mut kept = Vec::with_capacity(items.len());
    for item in items.iter() {
        if !pull_matches(item, argument)? {
            kept.push(item.clone());
        }
    }
    *items = kept;
    Ok(())
}

fn pull_all(document: &mut Document, path: &str, argument: &Bson) -> CommandResult<()> {
    let to_remove = argument.as_array().ok_or_else(|| {
        CommandError::bad_value("$pullAll requires an array argument")
    })?;
    let Some(items) = array_at(document, path)? else {
        return Ok(());
    };
    items.retain(|item| !to_remove.iter().any(|r| values_equal(item, r)));
    Ok(())
}
