/*!
 * @file sort.rs
 * @brief Stable multi-key document sort with canonical mixed-type ordering
 */

use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::error::{CommandError, CommandResult};
use crate::value::cmp_values;

/// A parsed sort specification: dotted path plus direction.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub path: String,
    pub ascending: bool,
}

pub fn parse_sort(spec: &Document) -> CommandResult<Vec<SortKey>> {
    let mut keys = Vec::with_capacity(spec.len());
    for (path, direction) in spec.iter() {
        let dir = match direction {
            Bson::Int32(1) | Bson::Int64(1) => 1,
            Bson::Int32(-1) | Bson::Int64(-1) => -1,
            Bson::Double(f) if *f == 1.0 => 1,
            Bson::Double(f) if *f == -1.0 => -1,
            _ => {
                return Err(CommandError::bad_value(format!(
                    "Illegal key in $sort specification: {path}: {direction}"
                )))
            }
        };
        if path.is_empty() {
            return Err(CommandError::bad_value("Empty field names are not allowed"));
        }
        keys.push(SortKey {
            path: path.clone(),
            ascending: dir == 1,
        });
    }
    Ok(keys)
}

// Direct dotted-path lookup; no implicit array fan-out. Missing sorts as
// null.
fn sort_value(doc: &Document, path: &str) -> Bson {
    let mut current = Bson::Document(doc.clone());
    for segment in path.split('.') {
        current = match &current {
            Bson::Document(d) => match d.get(segment) {
                Some(v) => v.clone(),
                None => return Bson::Null,
            },
            Bson::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v.clone(),
                None => return Bson::Null,
            },
            _ => return Bson::Null,
        };
    }
    current
}

/// Sort documents in place. The sort is stable, so equal keys keep their
/// original relative order.
pub fn sort_documents(docs: &mut [Document], spec: &Document) -> CommandResult<()> {
    let keys = parse_sort(spec)?;
    if keys.is_empty() {
        return Ok(());
    }
    docs.sort_by(|a, b| {
        for key in &keys {
            let va = sort_value(a, &key.path);
            let vb = sort_value(b, &key.path);
            let ord = cmp_values(&va, &vb);
            let ord = if key.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}
