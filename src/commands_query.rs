/*!
 * @file commands_query.rs
 * @brief Read-side handlers: find, count, distinct, aggregate, cursors
 */

use bson::{doc, Bson, Document};

use crate::backend::{BackendError, NamespaceKind, QueryParams};
use crate::commands::{
    batch_size_of, collection_of, cursor_reply, database_of, fetch_matching, map_backend_error,
    validate_namespace, CommandContext, HandlerFuture,
};
use crate::error::{CommandError, CommandResult, ErrorCode};
use crate::filter::{self, bson_truthy};
use crate::projection::Projection;
use crate::sort::sort_documents;
use crate::value::{cmp_values, values_equal};

fn non_negative_i64(request: &Document, field: &str) -> CommandResult<Option<i64>> {
    let value = match request.get(field) {
        None | Some(Bson::Null) => return Ok(None),
        Some(Bson::Int32(n)) => i64::from(*n),
        Some(Bson::Int64(n)) => *n,
        Some(Bson::Double(f)) if f.fract() == 0.0 => *f as i64,
        Some(other) => {
            return Err(CommandError::type_mismatch(format!(
                "BSON field '{field}' is the wrong type '{}'",
                crate::value::type_alias(other)
            )))
        }
    };
    if value < 0 {
        return Err(CommandError::bad_value(format!(
            "BSON field '{field}' value must be >= 0"
        )));
    }
    Ok(Some(value))
}

pub fn find<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "find")?;
        validate_namespace(&database, Some(&collection))?;

        let filter = request
            .get_document("filter")
            .map(Clone::clone)
            .unwrap_or_default();
        let sort = request.get_document("sort").ok().cloned();
        let projection = match request.get_document("projection") {
            Ok(spec) if !spec.is_empty() => Some(Projection::parse(spec)?),
            _ => None,
        };
        let skip = non_negative_i64(request, "skip")?.unwrap_or(0);
        let limit = match request.get("limit") {
            None | Some(Bson::Null) => 0,
            Some(Bson::Int32(n)) => i64::from(*n),
            Some(Bson::Int64(n)) => *n,
            Some(Bson::Double(f)) if f.fract() == 0.0 => *f as i64,
            Some(other) => {
                return Err(CommandError::type_mismatch(format!(
                    "BSON field 'find.limit' is the wrong type '{}'",
                    crate::value::type_alias(other)
                )))
            }
        };
        // A negative limit implies a single batch of at most |limit|.
        let single_batch = request.get("singleBatch").map(bson_truthy).unwrap_or(false)
            || limit < 0;
        let limit = limit.unsigned_abs() as usize;

        // The backend applies LIMIT only when its pushdown is complete;
        // sorting or skipping in memory needs the full result either way.
        let pushdown_limit = if sort.is_none() && skip == 0 && limit > 0 {
            Some(limit as i64)
        } else {
            None
        };
        let params = QueryParams {
            filter: filter.clone(),
            limit: pushdown_limit,
        };
        let mut documents = match cx.backend.query_documents(&database, &collection, &params).await
        {
            Ok(result) => {
                if result.pushdown_complete {
                    result.documents
                } else {
                    let mut matching = Vec::with_capacity(result.documents.len());
                    for document in result.documents {
                        if filter::matches(&document, &filter)? {
                            matching.push(document);
                        }
                    }
                    matching
                }
            }
            // Querying a namespace that does not exist returns an empty
            // cursor, not an error.
            Err(BackendError::NotFound(
                NamespaceKind::Database | NamespaceKind::Collection,
            )) => Vec::new(),
            Err(other) => return Err(map_backend_error(other)),
        };

        if let Some(sort_spec) = &sort {
            sort_documents(&mut documents, sort_spec)?;
        }
        if skip > 0 {
            let skip = (skip as usize).min(documents.len());
            documents.drain(..skip);
        }
        if limit > 0 {
            documents.truncate(limit);
        }
        if let Some(projection) = &projection {
            for document in &mut documents {
                *document = projection.apply(document);
            }
        }

        let batch = if single_batch {
            documents.len()
        } else {
            batch_size_of(request, cx.server.config.cursors.default_batch_size)?
        };
        let namespace = format!("{database}.{collection}");
        Ok(cursor_reply(
            cx.session,
            &database,
            &collection,
            namespace,
            documents,
            batch,
        ))
    })
}

pub fn count<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "count")?;
        validate_namespace(&database, Some(&collection))?;
        let query = request
            .get_document("query")
            .map(Clone::clone)
            .unwrap_or_default();
        let matches = fetch_matching(cx.backend, &database, &collection, &query).await?;
        let mut n = matches.len() as i64;
        if let Some(skip) = non_negative_i64(request, "skip")? {
            n = (n - skip).max(0);
        }
        if let Some(limit) = non_negative_i64(request, "limit")? {
            if limit > 0 {
                n = n.min(limit);
            }
        }
        Ok(doc! { "n": n as i32, "ok": 1.0 })
    })
}

// Distinct unwinds one array level: an array field contributes its
// elements, not itself.
fn distinct_values(value: &Bson, segments: &[&str], out: &mut Vec<Bson>) {
    if segments.is_empty() {
        match value {
            Bson::Array(items) => out.extend(items.iter().cloned()),
            other => out.push(other.clone()),
        }
        return;
    }
    match value {
        Bson::Document(inner) => {
            if let Some(next) = inner.get(segments[0]) {
                distinct_values(next, &segments[1..], out);
            }
        }
        Bson::Array(items) => {
            if let Ok(index) = segments[0].parse::<usize>() {
                if let Some(next) = items.get(index) {
                    distinct_values(next, &segments[1..], out);
                }
            }
            for item in items {
                if matches!(item, Bson::Document(_)) {
                    distinct_values(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

pub fn distinct<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "distinct")?;
        validate_namespace(&database, Some(&collection))?;
        let key = request
            .get_str("key")
            .map_err(|_| CommandError::bad_value("BSON field 'distinct.key' is missing"))?;
        if key.is_empty() {
            return Err(CommandError::bad_value("key cannot be an empty string"));
        }
        let query = request
            .get_document("query")
            .map(Clone::clone)
            .unwrap_or_default();
        let matches = fetch_matching(cx.backend, &database, &collection, &query).await?;

        let segments: Vec<&str> = key.split('.').collect();
        let mut values = Vec::new();
        for document in &matches {
            let mut found = Vec::new();
            distinct_values(&Bson::Document(document.clone()), &segments, &mut found);
            for value in found {
                if !values.iter().any(|v| values_equal(v, &value)) {
                    values.push(value);
                }
            }
        }
        values.sort_by(cmp_values);
        Ok(doc! { "values": Bson::Array(values), "ok": 1.0 })
    })
}

pub fn aggregate<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = match request.get("aggregate") {
            Some(Bson::String(name)) => name.clone(),
            _ => {
                return Err(CommandError::bad_value(
                    "database-level aggregate is not supported",
                ))
            }
        };
        validate_namespace(&database, Some(&collection))?;
        let pipeline = request
            .get_array("pipeline")
            .map_err(|_| CommandError::type_mismatch("BSON field 'pipeline' is missing"))?;

        let mut stages = Vec::with_capacity(pipeline.len());
        for stage in pipeline {
            let stage = stage
                .as_document()
                .ok_or_else(|| CommandError::type_mismatch("pipeline stages must be objects"))?;
            if stage.len() != 1 {
                return Err(CommandError::bad_value(
                    "A pipeline stage specification object must contain exactly one field.",
                ));
            }
            stages.push(stage.clone());
        }

        // A leading $match goes to the backend as the pushdown filter.
        let mut stage_iter = stages.iter().peekable();
        let initial_filter = match stage_iter.peek() {
            Some(stage) if stage.contains_key("$match") => {
                let stage = stage_iter.next().expect("peeked");
                stage
                    .get_document("$match")
                    .map(Clone::clone)
                    .map_err(|_| CommandError::type_mismatch("$match argument must be an object"))?
            }
            _ => Document::new(),
        };
        let mut documents =
            fetch_matching(cx.backend, &database, &collection, &initial_filter).await?;

        for stage in stage_iter {
            let (name, argument) = stage.iter().next().expect("validated non-empty");
            match name.as_str() {
                "$match" => {
                    let filter = argument.as_document().ok_or_else(|| {
                        CommandError::type_mismatch("$match argument must be an object")
                    })?;
                    let mut kept = Vec::with_capacity(documents.len());
                    for document in documents {
                        if filter::matches(&document, filter)? {
                            kept.push(document);
                        }
                    }
                    documents = kept;
                }
                "$sort" => {
                    let spec = argument.as_document().ok_or_else(|| {
                        CommandError::type_mismatch("$sort argument must be an object")
                    })?;
                    sort_documents(&mut documents, spec)?;
                }
                "$skip" => {
                    let n = stage_int(argument, "$skip")?;
                    let n = (n as usize).min(documents.len());
                    documents.drain(..n);
                }
                "$limit" => {
                    let n = stage_int(argument, "$limit")?;
                    documents.truncate(n as usize);
                }
                "$project" => {
                    let spec = argument.as_document().ok_or_else(|| {
                        CommandError::type_mismatch("$project argument must be an object")
                    })?;
                    let projection = Projection::parse(spec)?;
                    for document in &mut documents {
                        *document = projection.apply(document);
                    }
                }
                "$count" => {
                    let field = argument.as_str().ok_or_else(|| {
                        CommandError::type_mismatch("$count argument must be a string")
                    })?;
                    if field.is_empty() || field.starts_with('$') || field.contains('.') {
                        return Err(CommandError::bad_value(
                            "$count field name is invalid",
                        ));
                    }
                    let count = documents.len() as i32;
                    documents = if count > 0 {
                        vec![doc! { field: count }]
                    } else {
                        Vec::new()
                    };
                }
                other => {
                    return Err(CommandError::bad_value(format!(
                        "Unrecognized pipeline stage name: '{other}'"
                    )))
                }
            }
        }

        let batch = batch_size_of(request, cx.server.config.cursors.default_batch_size)?;
        let namespace = format!("{database}.{collection}");
        Ok(cursor_reply(
            cx.session,
            &database,
            &collection,
            namespace,
            documents,
            batch,
        ))
    })
}

fn stage_int(value: &Bson, stage: &str) -> CommandResult<i64> {
    let n = match value {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        Bson::Double(f) if f.fract() == 0.0 => *f as i64,
        _ => {
            return Err(CommandError::type_mismatch(format!(
                "{stage} argument must be an integer"
            )))
        }
    };
    if n < 0 {
        return Err(CommandError::bad_value(format!(
            "{stage} argument must be non-negative"
        )));
    }
    Ok(n)
}

pub fn get_more<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let cursor_id = match request.get("getMore") {
            Some(Bson::Int64(id)) => *id,
            Some(Bson::Int32(id)) => i64::from(*id),
            _ => {
                return Err(CommandError::type_mismatch(
                    "BSON field 'getMore' is the wrong type, expected type 'long'",
                ))
            }
        };
        let collection = request
            .get_str("collection")
            .map_err(|_| CommandError::bad_value("BSON field 'collection' is missing"))?
            .to_string();
        let batch = batch_size_of(request, cx.server.config.cursors.default_batch_size)?;

        let (documents, next_id, namespace) =
            cx.session.cursors.get_more(cursor_id, &collection, batch)?;
        let batch: Vec<Bson> = documents.into_iter().map(Bson::Document).collect();
        Ok(doc! {
            "cursor": {
                "nextBatch": batch,
                "id": next_id,
                "ns": namespace,
            },
            "ok": 1.0,
        })
    })
}

pub fn kill_cursors<'a>(
    cx: &'a mut CommandContext<'_>,
    request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let _collection = collection_of(request, "killCursors")?;
        let ids = request
            .get_array("cursors")
            .map_err(|_| CommandError::bad_value("BSON field 'cursors' is missing"))?;
        if ids.is_empty() {
            return Err(CommandError::new(
                ErrorCode::BadValue,
                "Must specify at least one cursor id in: { killCursors: ... }",
            ));
        }
        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        for id in ids {
            let id = match id {
                Bson::Int64(id) => *id,
                Bson::Int32(id) => i64::from(*id),
                _ => {
                    return Err(CommandError::type_mismatch(
                        "cursor ids must be 64-bit integers",
                    ))
                }
            };
            if cx.session.cursors.kill(id) {
                killed.push(Bson::Int64(id));
            } else {
                not_found.push(Bson::Int64(id));
            }
        }
        Ok(doc! {
            "cursorsKilled": Bson::Array(killed),
            "cursorsNotFound": Bson::Array(not_found),
            "cursorsAlive": Bson::Array(vec![]),
            "cursorsUnknown": Bson::Array(vec![]),
            "ok": 1.0,
        })
    })
}
