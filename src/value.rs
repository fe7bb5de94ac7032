/*!
 * @file value.rs
 * @brief Canonical BSON value comparison and type ordering
 */

use std::cmp::Ordering;

use bson::Bson;

/// Canonical type rank used for cross-type comparison. Numbers share a rank
/// regardless of representation; missing fields compare as Null.
pub fn canonical_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 12,
        // Deprecated types the wire can still carry; ordered after regex.
        Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_) | Bson::DbPointer(_) => 13,
    }
}

/// Numeric view of a BSON value for cross-representation comparison.
enum Numeric {
    Int(i64),
    Float(f64),
}

fn as_numeric(value: &Bson) -> Option<Numeric> {
    match value {
        Bson::Int32(i) => Some(Numeric::Int(i64::from(*i))),
        Bson::Int64(i) => Some(Numeric::Int(*i)),
        Bson::Double(f) => Some(Numeric::Float(*f)),
        // Decimal128 participates through its decimal string form. Ordinary
        // values parse exactly into f64's range; extreme exponents saturate
        // to infinities, which still order correctly against finite numbers.
        Bson::Decimal128(d) => {
            let s = d.to_string();
            match s.as_str() {
                "NaN" => Some(Numeric::Float(f64::NAN)),
                "Infinity" => Some(Numeric::Float(f64::INFINITY)),
                "-Infinity" => Some(Numeric::Float(f64::NEG_INFINITY)),
                _ => s.parse::<f64>().ok().map(Numeric::Float),
            }
        }
        _ => None,
    }
}

// i64 cannot always round-trip through f64; widen to f64 only when the float
// is outside i64's exact range, otherwise compare against the truncation.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        // NaN sorts before all numbers.
        return Ordering::Greater;
    }
    if f >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    if f < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let trunc = f.trunc() as i64;
    match i.cmp(&trunc) {
        Ordering::Equal => {
            let frac = f - f.trunc();
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

fn cmp_numeric(a: Numeric, b: Numeric) -> Ordering {
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => x.cmp(&y),
        (Numeric::Int(x), Numeric::Float(y)) => cmp_int_float(x, y),
        (Numeric::Float(x), Numeric::Int(y)) => cmp_int_float(y, x).reverse(),
        (Numeric::Float(x), Numeric::Float(y)) => {
            if x.is_nan() && y.is_nan() {
                Ordering::Equal
            } else if x.is_nan() {
                Ordering::Less
            } else if y.is_nan() {
                Ordering::Greater
            } else {
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        }
    }
}

/// Total order over BSON values following MongoDB's canonical comparison:
/// type rank first, then the per-type rule.
pub fn cmp_values(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (canonical_rank(a), canonical_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Bson::MinKey, Bson::MinKey) | (Bson::MaxKey, Bson::MaxKey) => Ordering::Equal,
        (Bson::Null | Bson::Undefined, Bson::Null | Bson::Undefined) => Ordering::Equal,
        _ if ra == 2 => {
            match (as_numeric(a), as_numeric(b)) {
                (Some(x), Some(y)) => cmp_numeric(x, y),
                _ => Ordering::Equal,
            }
        }
        (Bson::String(x) | Bson::Symbol(x), Bson::String(y) | Bson::Symbol(y)) => {
            x.as_bytes().cmp(y.as_bytes())
        }
        (Bson::Document(x), Bson::Document(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let key_ord = ka.as_bytes().cmp(kb.as_bytes());
                if key_ord != Ordering::Equal {
                    return key_ord;
                }
                let val_ord = cmp_values(va, vb);
                if val_ord != Ordering::Equal {
                    return val_ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Array(x), Bson::Array(y)) => {
            for (va, vb) in x.iter().zip(y.iter()) {
                let ord = cmp_values(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| u8::from(x.subtype).cmp(&u8::from(y.subtype)))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            x.time.cmp(&y.time).then_with(|| x.increment.cmp(&y.increment))
        }
        (Bson::RegularExpression(x), Bson::RegularExpression(y)) => x
            .pattern
            .as_bytes()
            .cmp(y.pattern.as_bytes())
            .then_with(|| x.options.as_bytes().cmp(y.options.as_bytes())),
        _ => Ordering::Equal,
    }
}

pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    cmp_values(a, b) == Ordering::Equal
}

/// `$type` string alias for a value.
pub fn type_alias(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Binary(_) => "binData",
        Bson::ObjectId(_) => "objectId",
        Bson::Boolean(_) => "bool",
        Bson::DateTime(_) => "date",
        Bson::Null => "null",
        Bson::RegularExpression(_) => "regex",
        Bson::Int32(_) => "int",
        Bson::Timestamp(_) => "timestamp",
        Bson::Int64(_) => "long",
        Bson::Decimal128(_) => "decimal",
        Bson::MinKey => "minKey",
        Bson::MaxKey => "maxKey",
        Bson::Undefined => "undefined",
        Bson::Symbol(_) => "symbol",
        Bson::JavaScriptCode(_) => "javascript",
        Bson::JavaScriptCodeWithScope(_) => "javascriptWithScope",
        Bson::DbPointer(_) => "dbPointer",
    }
}

/// BSON type number as used by `$type`.
pub fn type_number(value: &Bson) -> i32 {
    match value {
        Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::Undefined => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Null => 10,
        Bson::RegularExpression(_) => 11,
        Bson::DbPointer(_) => 12,
        Bson::JavaScriptCode(_) => 13,
        Bson::Symbol(_) => 14,
        Bson::JavaScriptCodeWithScope(_) => 15,
        Bson::Int32(_) => 16,
        Bson::Timestamp(_) => 17,
        Bson::Int64(_) => 18,
        Bson::Decimal128(_) => 19,
        Bson::MinKey => -1,
        Bson::MaxKey => 127,
    }
}

/// True when the two values are both numeric or both share a canonical rank,
/// i.e. an order comparison between them is meaningful.
pub fn comparable(a: &Bson, b: &Bson) -> bool {
    canonical_rank(a) == canonical_rank(b)
}
