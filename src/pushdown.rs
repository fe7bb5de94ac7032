/*!
 * @file pushdown.rs
 * @brief Translation of filter predicates into JSONB WHERE clauses
 */

use bson::{Bson, Document};
use serde_json::Value;
use tokio_postgres::types::ToSql;

use crate::pgjson;

/// A bound statement parameter. Field paths bind as text, encoded values as
/// jsonb, numeric bounds as text cast to numeric in the clause.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Jsonb(Value),
}

impl SqlParam {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Text(text) => text,
            SqlParam::Jsonb(value) => value,
        }
    }
}

/// Filter translation result. `clauses` are AND-ed into the WHERE clause and
/// reference `params` by `$n` position; `complete` is true only when every
/// filter element translated exactly, in which case the in-memory
/// re-evaluation can be skipped and LIMIT pushed.
#[derive(Debug, Default)]
pub struct Pushdown {
    pub clauses: Vec<String>,
    pub params: Vec<SqlParam>,
    pub complete: bool,
}

impl Pushdown {
    pub fn where_clause(&self) -> Option<String> {
        if self.clauses.is_empty() {
            None
        } else {
            Some(format!("WHERE {}", self.clauses.join(" AND ")))
        }
    }

    /// Parameter slice in `$n` order, ready for `client.query`.
    pub fn sql_params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(SqlParam::as_sql).collect()
    }
}

// Sequential `$n` allocator. Placeholders are baked into clause text at push
// time, so discarded clauses must truncate back to their mark or later
// numbering would drift from the parameter list.
#[derive(Debug, Default)]
struct ParamSet {
    values: Vec<SqlParam>,
}

impl ParamSet {
    fn mark(&self) -> usize {
        self.values.len()
    }

    fn truncate(&mut self, mark: usize) {
        self.values.truncate(mark);
    }

    fn field(&mut self, name: &str) -> String {
        self.values.push(SqlParam::Text(name.to_string()));
        format!("_jsonb->${}::text", self.values.len())
    }

    fn field_text(&mut self, name: &str) -> String {
        self.values.push(SqlParam::Text(name.to_string()));
        format!("_jsonb->>${}::text", self.values.len())
    }

    fn field_exists(&mut self, name: &str) -> String {
        self.values.push(SqlParam::Text(name.to_string()));
        format!("_jsonb ? ${}::text", self.values.len())
    }

    fn jsonb(&mut self, value: Value) -> String {
        self.values.push(SqlParam::Jsonb(value));
        format!("${}::jsonb", self.values.len())
    }

    // Bound as text so the parameter encodes as a string, then cast; a bare
    // ::numeric cast would make the server expect a binary numeric.
    fn numeric(&mut self, literal: String) -> String {
        self.values.push(SqlParam::Text(literal));
        format!("${}::text::numeric", self.values.len())
    }
}

/// One translated filter element.
enum Translated {
    /// SQL selects exactly the matching rows.
    Exact(String),
    /// SQL selects a superset; the full filter must re-run in memory.
    Superset(String),
    /// Nothing pushable; rows filtered in memory only.
    Residual,
}

/// Translate a top-level filter document. Only simple (dot-free) paths and
/// the operators the JSONB encoding can express are pushed; everything else
/// stays residual.
pub fn translate(filter: &Document) -> Pushdown {
    let mut params = ParamSet::default();
    let mut clauses = Vec::new();
    let mut complete = true;
    for (path, condition) in filter.iter() {
        let mark = params.mark();
        match translate_element(path, condition, &mut params) {
            Translated::Exact(sql) => clauses.push(sql),
            Translated::Superset(sql) => {
                clauses.push(sql);
                complete = false;
            }
            Translated::Residual => {
                params.truncate(mark);
                complete = false;
            }
        }
    }
    Pushdown {
        clauses,
        params: params.values,
        complete,
    }
}

fn translate_element(path: &str, condition: &Bson, params: &mut ParamSet) -> Translated {
    if path.starts_with('$') || path.contains('.') || path.is_empty() {
        return Translated::Residual;
    }
    match condition {
        Bson::Document(cond)
            if cond.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) =>
        {
            translate_operators(path, cond, params)
        }
        Bson::Document(_) | Bson::Array(_) | Bson::RegularExpression(_) => Translated::Residual,
        scalar => translate_eq(path, scalar, params),
    }
}

fn translate_operators(path: &str, cond: &Document, params: &mut ParamSet) -> Translated {
    let mut parts = Vec::new();
    let mut exact = true;
    for (op, operand) in cond.iter() {
        let mark = params.mark();
        let translated = match op.as_str() {
            "$eq" => translate_eq(path, operand, params),
            "$gt" => translate_range(path, ">", operand, params),
            "$gte" => translate_range(path, ">=", operand, params),
            "$lt" => translate_range(path, "<", operand, params),
            "$lte" => translate_range(path, "<=", operand, params),
            "$in" => translate_in(path, operand, params),
            "$exists" => translate_exists(path, operand, params),
            _ => Translated::Residual,
        };
        match translated {
            Translated::Exact(sql) => parts.push(sql),
            Translated::Superset(sql) => {
                parts.push(sql);
                exact = false;
            }
            Translated::Residual => {
                params.truncate(mark);
                exact = false;
            }
        }
    }
    if parts.is_empty() {
        return Translated::Residual;
    }
    let sql = if parts.len() == 1 {
        parts.remove(0)
    } else {
        format!("({})", parts.join(" AND "))
    };
    if exact {
        Translated::Exact(sql)
    } else {
        Translated::Superset(sql)
    }
}

// Encoding variants an equality may be stored under. Strings and booleans
// have a single form; numbers have one per numeric representation.
fn equality_variants(value: &Bson) -> Option<(Vec<Value>, bool)> {
    match value {
        Bson::String(_) | Bson::Boolean(_) => {
            let encoded = pgjson::encode_value(value).ok()?;
            Some((vec![encoded], true))
        }
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
            let mut variants = Vec::new();
            let (integral, as_i64, as_f64) = match value {
                Bson::Int32(i) => (true, Some(i64::from(*i)), f64::from(*i)),
                Bson::Int64(i) => (true, Some(*i), *i as f64),
                Bson::Double(f) => (f.fract() == 0.0 && f.is_finite(), None, *f),
                _ => unreachable!(),
            };
            let as_i64 = as_i64.or_else(|| {
                if integral && as_f64.abs() < 9.0e18 {
                    Some(as_f64 as i64)
                } else {
                    None
                }
            });
            if let Some(i) = as_i64 {
                if let Ok(small) = i32::try_from(i) {
                    variants.push(pgjson::encode_value(&Bson::Int32(small)).ok()?);
                }
                variants.push(pgjson::encode_value(&Bson::Int64(i)).ok()?);
                if (i as f64) as i64 == i {
                    variants.push(pgjson::encode_value(&Bson::Double(i as f64)).ok()?);
                }
            } else {
                variants.push(pgjson::encode_value(value).ok()?);
            }
            // Stored decimal128 values cannot match these variants, so the
            // result is a superset pre-filter.
            Some((variants, false))
        }
        _ => None,
    }
}

fn translate_eq(path: &str, operand: &Bson, params: &mut ParamSet) -> Translated {
    let Some((variants, exact)) = equality_variants(operand) else {
        return Translated::Residual;
    };
    let mut parts = Vec::new();
    for variant in variants {
        let access = params.field(path);
        let value = params.jsonb(variant.clone());
        parts.push(format!("{access} = {value}"));
        // `@>` with the single-element array form covers implicit array
        // traversal without matching nested arrays.
        let access = params.field(path);
        let wrapped = params.jsonb(Value::Array(vec![variant]));
        parts.push(format!("{access} @> {wrapped}"));
    }
    let sql = format!("({})", parts.join(" OR "));
    if exact {
        Translated::Exact(sql)
    } else {
        Translated::Superset(sql)
    }
}

fn numeric_literal(value: &Bson) -> Option<String> {
    match value {
        Bson::Int32(i) => Some(i.to_string()),
        Bson::Int64(i) => Some(i.to_string()),
        Bson::Double(f) if f.is_finite() => Some(format!("{}", f)),
        _ => None,
    }
}

// Plain-number comparison, widened with type guards covering the tagged
// numeric encodings and arrays; always a superset.
fn translate_range(path: &str, op: &str, operand: &Bson, params: &mut ParamSet) -> Translated {
    let Some(literal) = numeric_literal(operand) else {
        return Translated::Residual;
    };
    let probe = params.field(path);
    let text = params.field_text(path);
    let bound = params.numeric(literal);
    let guard = params.field(path);
    Translated::Superset(format!(
        "((jsonb_typeof({probe}) = 'number' AND ({text})::numeric {op} {bound}) \
         OR jsonb_typeof({guard}) IN ('object', 'array'))"
    ))
}

fn translate_in(path: &str, operand: &Bson, params: &mut ParamSet) -> Translated {
    let Bson::Array(items) = operand else {
        return Translated::Residual;
    };
    if items.is_empty() {
        return Translated::Residual;
    }
    let mut parts = Vec::new();
    let mut exact = true;
    for item in items {
        match translate_eq(path, item, params) {
            Translated::Exact(sql) => parts.push(sql),
            Translated::Superset(sql) => {
                parts.push(sql);
                exact = false;
            }
            // The caller truncates the parameters back to its own mark.
            Translated::Residual => return Translated::Residual,
        }
    }
    let sql = format!("({})", parts.join(" OR "));
    if exact {
        Translated::Exact(sql)
    } else {
        Translated::Superset(sql)
    }
}

fn translate_exists(path: &str, operand: &Bson, params: &mut ParamSet) -> Translated {
    let access = params.field_exists(path);
    if crate::filter::bson_truthy(operand) {
        Translated::Exact(access)
    } else {
        Translated::Exact(format!("NOT ({access})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use serde_json::json;

    // Highest `$n` referenced by the generated SQL; must equal the number of
    // bound parameters or the statement would fail to bind.
    fn max_placeholder(pushdown: &Pushdown) -> usize {
        let sql = pushdown.clauses.join(" ");
        let mut max = 0;
        let bytes = sql.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'$' {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                if j > i + 1 {
                    max = max.max(sql[i + 1..j].parse::<usize>().unwrap());
                }
                i = j;
            } else {
                i += 1;
            }
        }
        max
    }

    fn assert_bindings_align(pushdown: &Pushdown) {
        assert_eq!(max_placeholder(pushdown), pushdown.params.len());
    }

    #[test]
    fn empty_filter_is_complete() {
        let p = translate(&doc! {});
        assert!(p.complete);
        assert!(p.where_clause().is_none());
        assert!(p.params.is_empty());
    }

    #[test]
    fn string_equality_is_exact_and_bound() {
        let p = translate(&doc! {"name": "abc"});
        assert!(p.complete);
        let where_sql = p.where_clause().unwrap();
        assert!(where_sql.contains("_jsonb->$1::text = $2::jsonb"));
        assert!(where_sql.contains("_jsonb->$3::text @> $4::jsonb"));
        assert_eq!(
            p.params,
            vec![
                SqlParam::Text("name".to_string()),
                SqlParam::Jsonb(json!("abc")),
                SqlParam::Text("name".to_string()),
                SqlParam::Jsonb(json!(["abc"])),
            ]
        );
        assert_bindings_align(&p);
    }

    #[test]
    fn int_equality_binds_plain_number_and_is_partial() {
        let p = translate(&doc! {"a": 1i32});
        assert!(!p.complete);
        assert_bindings_align(&p);
        assert!(p.params.contains(&SqlParam::Jsonb(json!(1))));
        assert!(p
            .params
            .contains(&SqlParam::Jsonb(json!({"$numberLong": "1"}))));
    }

    #[test]
    fn mixed_filter_keeps_pushable_part() {
        // The regex stays residual; the equality is still pushed and its
        // parameters stay aligned with the surviving placeholders.
        let p = translate(&doc! {"a": 1i32, "b": {"$regex": "^x"}});
        assert!(!p.complete);
        assert_eq!(p.clauses.len(), 1);
        assert!(p.clauses[0].contains("_jsonb->$1::text = $2::jsonb"));
        assert_bindings_align(&p);
    }

    #[test]
    fn dotted_paths_are_residual() {
        let p = translate(&doc! {"a.b": 1});
        assert!(!p.complete);
        assert!(p.where_clause().is_none());
        assert!(p.params.is_empty());
    }

    #[test]
    fn null_equality_is_residual() {
        let p = translate(&doc! {"a": Bson::Null});
        assert!(!p.complete);
        assert!(p.where_clause().is_none());
        assert!(p.params.is_empty());
    }

    #[test]
    fn exists_is_exact() {
        let p = translate(&doc! {"a": {"$exists": true}, "b": {"$exists": false}});
        assert!(p.complete);
        let where_sql = p.where_clause().unwrap();
        assert!(where_sql.contains("_jsonb ? $1::text"));
        assert!(where_sql.contains("NOT (_jsonb ? $2::text)"));
        assert_eq!(
            p.params,
            vec![
                SqlParam::Text("a".to_string()),
                SqlParam::Text("b".to_string()),
            ]
        );
    }

    #[test]
    fn range_is_superset() {
        let p = translate(&doc! {"n": {"$gt": 5}});
        assert!(!p.complete);
        let where_sql = p.where_clause().unwrap();
        assert!(where_sql.contains("jsonb_typeof(_jsonb->$1::text) = 'number'"));
        assert!(where_sql.contains("::numeric > $3::text::numeric"));
        assert!(p.params.contains(&SqlParam::Text("5".to_string())));
        assert_bindings_align(&p);
    }

    #[test]
    fn in_over_strings_is_exact() {
        let p = translate(&doc! {"s": {"$in": ["a", "b"]}});
        assert!(p.complete);
        assert!(p.params.contains(&SqlParam::Jsonb(json!("a"))));
        assert!(p.params.contains(&SqlParam::Jsonb(json!("b"))));
        assert_bindings_align(&p);
    }

    #[test]
    fn in_with_document_element_is_residual() {
        let p = translate(&doc! {"s": {"$in": [{"x": 1}]}});
        assert!(!p.complete);
        assert!(p.where_clause().is_none());
        assert!(p.params.is_empty());
    }

    #[test]
    fn values_never_appear_in_the_sql_text() {
        let p = translate(&doc! {"s": "it's"});
        assert!(p.complete);
        let where_sql = p.where_clause().unwrap();
        assert!(!where_sql.contains("it's"));
        assert!(p.params.contains(&SqlParam::Jsonb(json!("it's"))));
        assert_bindings_align(&p);
    }

    #[test]
    fn logical_operators_are_residual() {
        let p = translate(&doc! {"$or": [{"a": 1}, {"b": 2}]});
        assert!(!p.complete);
        assert!(p.where_clause().is_none());
        assert!(p.params.is_empty());
    }

    #[test]
    fn combined_operators_on_one_field() {
        let p = translate(&doc! {"n": {"$gte": 1, "$lte": 9}});
        assert!(!p.complete);
        let where_sql = p.where_clause().unwrap();
        assert!(where_sql.contains(">= $3::text::numeric"));
        assert!(where_sql.contains("<= $7::text::numeric"));
        assert_bindings_align(&p);
    }

    #[test]
    fn discarded_operators_release_their_parameters() {
        // $type is residual; its placeholders must not leave orphaned
        // parameters behind the kept $gte clause.
        let p = translate(&doc! {"n": {"$gte": 1, "$type": "int"}, "m": 2i32});
        assert!(!p.complete);
        assert_eq!(p.clauses.len(), 2);
        assert_bindings_align(&p);
    }
}
