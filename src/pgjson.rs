/*!
 * @file pgjson.rs
 * @brief BSON <-> JSONB codec (canonical extended-JSON tags plus "$k" order)
 */

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, DateTime, Document, Regex as BsonRegex, Timestamp};
use serde_json::{json, Map, Number, Value};

use crate::error::{FerroDBError, Result};

// JSONB does not preserve object key order; every encoded document level
// carries its field names under this key, in insertion order.
const KEY_ORDER: &str = "$k";

fn codec_err(message: impl Into<String>) -> FerroDBError {
    FerroDBError::Codec(message.into())
}

/// Encode a document into its on-disk JSONB form.
pub fn encode_document(doc: &Document) -> Result<Value> {
    let mut keys = Vec::with_capacity(doc.len());
    let mut out = Map::with_capacity(doc.len() + 1);
    for (name, value) in doc.iter() {
        if name == KEY_ORDER {
            return Err(codec_err(format!("invalid field name: {KEY_ORDER}")));
        }
        keys.push(Value::String(name.clone()));
        out.insert(name.clone(), encode_value(value)?);
    }
    let mut wrapped = Map::with_capacity(out.len() + 1);
    wrapped.insert(KEY_ORDER.to_string(), Value::Array(keys));
    wrapped.extend(out);
    Ok(Value::Object(wrapped))
}

/// Encode a single value. Untagged int32 is the plain-number default; every
/// other type keeps a canonical extended-JSON tag.
pub fn encode_value(value: &Bson) -> Result<Value> {
    Ok(match value {
        Bson::Null => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::Number(Number::from(*i)),
        Bson::Int64(i) => json!({ "$numberLong": i.to_string() }),
        Bson::Double(f) => json!({ "$numberDouble": double_to_string(*f) }),
        Bson::Decimal128(d) => json!({ "$numberDecimal": d.to_string() }),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Document(d) => encode_document(d)?,
        Bson::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_value(item)?);
            }
            Value::Array(out)
        }
        Bson::Binary(b) => json!({
            "$binary": {
                "base64": BASE64.encode(&b.bytes),
                "subType": format!("{:02x}", u8::from(b.subtype)),
            }
        }),
        Bson::ObjectId(oid) => json!({ "$oid": oid.to_hex() }),
        Bson::DateTime(dt) => json!({
            "$date": { "$numberLong": dt.timestamp_millis().to_string() }
        }),
        Bson::RegularExpression(re) => json!({
            "$regularExpression": { "pattern": re.pattern.clone(), "options": re.options.clone() }
        }),
        Bson::Timestamp(ts) => json!({ "$timestamp": { "t": ts.time, "i": ts.increment } }),
        Bson::MinKey => json!({ "$minKey": 1 }),
        Bson::MaxKey => json!({ "$maxKey": 1 }),
        other => {
            return Err(codec_err(format!(
                "type cannot be stored: {}",
                crate::value::type_alias(other)
            )))
        }
    })
}

fn double_to_string(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f == f64::INFINITY {
        "Infinity".to_string()
    } else if f == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        // Display for f64 is the shortest representation that round-trips.
        format!("{}", f)
    }
}

/// Decode the on-disk JSONB form back into a document.
pub fn decode_document(value: &Value) -> Result<Document> {
    let obj = value
        .as_object()
        .ok_or_else(|| codec_err("expected a JSON object at document level"))?;
    let keys = obj
        .get(KEY_ORDER)
        .ok_or_else(|| codec_err(format!("document is missing {KEY_ORDER}")))?
        .as_array()
        .ok_or_else(|| codec_err(format!("{KEY_ORDER} must be an array")))?;
    if keys.len() != obj.len() - 1 {
        return Err(codec_err(format!("{KEY_ORDER} does not match document keys")));
    }
    let mut doc = Document::new();
    for key in keys {
        let name = key
            .as_str()
            .ok_or_else(|| codec_err(format!("{KEY_ORDER} entries must be strings")))?;
        let field = obj
            .get(name)
            .ok_or_else(|| codec_err(format!("{KEY_ORDER} names a missing field: {name}")))?;
        doc.insert(name.to_string(), decode_value(field)?);
    }
    Ok(doc)
}

pub fn decode_value(value: &Value) -> Result<Bson> {
    Ok(match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::String(s) => Bson::String(s.clone()),
        Value::Number(n) => decode_number(n)?,
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_value(item)?);
            }
            Bson::Array(out)
        }
        Value::Object(obj) => {
            if obj.contains_key(KEY_ORDER) {
                Bson::Document(decode_document(value)?)
            } else {
                decode_tagged(obj)?
            }
        }
    })
}

// A plain number is an untagged integer; pick the smallest exact
// representation, falling back to double.
fn decode_number(n: &Number) -> Result<Bson> {
    if let Some(i) = n.as_i64() {
        if let Ok(small) = i32::try_from(i) {
            return Ok(Bson::Int32(small));
        }
        return Ok(Bson::Int64(i));
    }
    n.as_f64()
        .map(Bson::Double)
        .ok_or_else(|| codec_err(format!("unrepresentable number: {n}")))
}

fn decode_tagged(obj: &Map<String, Value>) -> Result<Bson> {
    let tag = obj
        .keys()
        .next()
        .ok_or_else(|| codec_err("empty object without key order"))?
        .clone();
    match tag.as_str() {
        "$oid" => {
            let hex = expect_str(obj, "$oid")?;
            let oid = bson::oid::ObjectId::parse_str(hex)
                .map_err(|e| codec_err(format!("invalid $oid: {e}")))?;
            Ok(Bson::ObjectId(oid))
        }
        "$numberLong" => {
            let s = expect_str(obj, "$numberLong")?;
            let i = s
                .parse::<i64>()
                .map_err(|e| codec_err(format!("invalid $numberLong: {e}")))?;
            Ok(Bson::Int64(i))
        }
        "$numberInt" => {
            let s = expect_str(obj, "$numberInt")?;
            let i = s
                .parse::<i32>()
                .map_err(|e| codec_err(format!("invalid $numberInt: {e}")))?;
            Ok(Bson::Int32(i))
        }
        "$numberDouble" => {
            let s = expect_str(obj, "$numberDouble")?;
            let f = match s {
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                "NaN" => f64::NAN,
                other => other
                    .parse::<f64>()
                    .map_err(|e| codec_err(format!("invalid $numberDouble: {e}")))?,
            };
            Ok(Bson::Double(f))
        }
        "$numberDecimal" => {
            let s = expect_str(obj, "$numberDecimal")?;
            let d = s
                .parse::<bson::Decimal128>()
                .map_err(|e| codec_err(format!("invalid $numberDecimal: {e}")))?;
            Ok(Bson::Decimal128(d))
        }
        "$date" => {
            let inner = obj
                .get("$date")
                .and_then(|v| v.as_object())
                .and_then(|o| o.get("$numberLong"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| codec_err("invalid $date payload"))?;
            let millis = inner
                .parse::<i64>()
                .map_err(|e| codec_err(format!("invalid $date: {e}")))?;
            Ok(Bson::DateTime(DateTime::from_millis(millis)))
        }
        "$binary" => {
            let inner = obj
                .get("$binary")
                .and_then(|v| v.as_object())
                .ok_or_else(|| codec_err("invalid $binary payload"))?;
            let data = inner
                .get("base64")
                .and_then(|v| v.as_str())
                .ok_or_else(|| codec_err("$binary is missing base64"))?;
            let subtype = inner
                .get("subType")
                .and_then(|v| v.as_str())
                .ok_or_else(|| codec_err("$binary is missing subType"))?;
            let bytes = BASE64
                .decode(data)
                .map_err(|e| codec_err(format!("invalid $binary base64: {e}")))?;
            let subtype = u8::from_str_radix(subtype, 16)
                .map_err(|e| codec_err(format!("invalid $binary subType: {e}")))?;
            Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::from(subtype),
                bytes,
            }))
        }
        "$timestamp" => {
            let inner = obj
                .get("$timestamp")
                .and_then(|v| v.as_object())
                .ok_or_else(|| codec_err("invalid $timestamp payload"))?;
            let t = inner
                .get("t")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| codec_err("$timestamp is missing t"))?;
            let i = inner
                .get("i")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| codec_err("$timestamp is missing i"))?;
            Ok(Bson::Timestamp(Timestamp {
                time: t as u32,
                increment: i as u32,
            }))
        }
        "$regularExpression" => {
            let inner = obj
                .get("$regularExpression")
                .and_then(|v| v.as_object())
                .ok_or_else(|| codec_err("invalid $regularExpression payload"))?;
            let pattern = inner
                .get("pattern")
                .and_then(|v| v.as_str())
                .ok_or_else(|| codec_err("$regularExpression is missing pattern"))?;
            let options = inner
                .get("options")
                .and_then(|v| v.as_str())
                .ok_or_else(|| codec_err("$regularExpression is missing options"))?;
            Ok(Bson::RegularExpression(BsonRegex {
                pattern: pattern.to_string(),
                options: options.to_string(),
            }))
        }
        "$minKey" => Ok(Bson::MinKey),
        "$maxKey" => Ok(Bson::MaxKey),
        other if other.starts_with('$') => Err(codec_err(format!("unknown tag: {other}"))),
        _ => Err(codec_err(format!(
            "object is missing {KEY_ORDER} and is not a tagged scalar"
        ))),
    }
}

fn expect_str<'a>(obj: &'a Map<String, Value>, tag: &str) -> Result<&'a str> {
    obj.get(tag)
        .and_then(|v| v.as_str())
        .ok_or_else(|| codec_err(format!("{tag} payload must be a string")))
}
