/*!
 * @file commands_write.rs
 * @brief Batched write command handlers: insert, update, delete, findAndModify
 */

use bson::{doc, oid::ObjectId, Bson, Document};

use crate::commands::{
    collection_of, database_of, fetch_matching, map_backend_error, validate_namespace, with_retry,
    CommandContext, HandlerFuture,
};
use crate::error::{CommandError, CommandResult, ErrorCode};
use crate::filter::bson_truthy;
use crate::projection::Projection;
use crate::sort::sort_documents;
use crate::update::{apply_update, is_operator_update};

/// Give every inserted document an `_id`, generated first when absent.
fn ensure_id(document: &Document) -> Document {
    if document.contains_key("_id") {
        return document.clone();
    }
    let mut with_id = Document::new();
    with_id.insert("_id", ObjectId::new());
    for (key, value) in document.iter() {
        with_id.insert(key.clone(), value.clone());
    }
    with_id
}

fn write_error(index: usize, error: &CommandError) -> Document {
    doc! {
        "index": index as i32,
        "code": error.code.code(),
        "errmsg": error.message.clone(),
    }
}

pub fn insert<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "insert")?;
        validate_namespace(&database, Some(&collection))?;
        let documents = request
            .get_array("documents")
            .map_err(|_| CommandError::bad_value("BSON field 'insert.documents' is missing"))?;
        let ordered = request.get("ordered").map(bson_truthy).unwrap_or(true);

        let backend = cx.backend;
        with_retry(|| backend.create_collection_if_not_exists(&database, &collection))
            .await
            .map_err(map_backend_error)?;

        let mut inserted = 0i32;
        let mut write_errors = Vec::new();
        for (index, value) in documents.iter().enumerate() {
            let Some(document) = value.as_document() else {
                let error = CommandError::type_mismatch(format!(
                    "BSON field 'insert.documents.{index}' is the wrong type"
                ));
                write_errors.push(write_error(index, &error));
                if ordered {
                    break;
                }
                continue;
            };
            let prepared = ensure_id(document);
            let outcome =
                with_retry(|| backend.insert_document(&database, &collection, &prepared)).await;
            match outcome {
                Ok(()) => inserted += 1,
                Err(backend_error) => {
                    let error = map_backend_error(backend_error);
                    write_errors.push(write_error(index, &error));
                    if ordered {
                        break;
                    }
                }
            }
        }

        let mut reply = doc! { "n": inserted };
        if !write_errors.is_empty() {
            reply.insert(
                "writeErrors",
                Bson::Array(write_errors.into_iter().map(Bson::Document).collect()),
            );
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    })
}

struct UpdateStats {
    matched: i32,
    modified: i32,
    upserted_id: Option<Bson>,
}

/// Reconstruct the base document an upsert starts from: the equality
/// constraints of the query.
fn upsert_base(query: &Document) -> Document {
    let mut base = Document::new();
    for (key, value) in query.iter() {
        if key.starts_with('$') || key.contains('.') {
            continue;
        }
        match value {
            Bson::Document(cond)
                if cond.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) =>
            {
                if let (1, Some(eq)) = (cond.len(), cond.get("$eq")) {
                    base.insert(key.clone(), eq.clone());
                }
            }
            plain => {
                base.insert(key.clone(), plain.clone());
            }
        }
    }
    base
}

async fn apply_single_update(
    cx: &CommandContext<'_>,
    database: &str,
    collection: &str,
    entry: &Bson,
) -> CommandResult<UpdateStats> {
    let entry = entry
        .as_document()
        .ok_or_else(|| CommandError::type_mismatch("update entries must be objects"))?;
    let query = entry
        .get_document("q")
        .map_err(|_| CommandError::type_mismatch("BSON field 'update.updates.q' is missing"))?;
    let update = match entry.get("u") {
        Some(Bson::Document(update)) => update,
        Some(Bson::Array(_)) => {
            return Err(CommandError::bad_value(
                "aggregation pipelines in updates are not supported",
            ))
        }
        _ => {
            return Err(CommandError::type_mismatch(
                "BSON field 'update.updates.u' is missing or the wrong type",
            ))
        }
    };
    let multi = entry.get("multi").map(bson_truthy).unwrap_or(false);
    let upsert = entry.get("upsert").map(bson_truthy).unwrap_or(false);
    if multi && !is_operator_update(update)? {
        return Err(CommandError::new(
            ErrorCode::FailedToParse,
            "multi update is not supported for replacement-style update",
        ));
    }

    let backend = cx.backend;
    let matches = fetch_matching(backend, database, collection, query).await?;
    if matches.is_empty() {
        if !upsert {
            return Ok(UpdateStats {
                matched: 0,
                modified: 0,
                upserted_id: None,
            });
        }
        let outcome = apply_update(&upsert_base(query), update)?;
        let inserted = ensure_id(&outcome.document);
        let id = inserted.get("_id").cloned().expect("ensure_id");
        with_retry(|| backend.create_collection_if_not_exists(database, collection))
            .await
            .map_err(map_backend_error)?;
        with_retry(|| backend.insert_document(database, collection, &inserted))
            .await
            .map_err(map_backend_error)?;
        return Ok(UpdateStats {
            matched: 0,
            modified: 0,
            upserted_id: Some(id),
        });
    }

    let targets: Vec<&Document> = if multi {
        matches.iter().collect()
    } else {
        matches.iter().take(1).collect()
    };
    let mut matched = 0i32;
    let mut modified = 0i32;
    for target in targets {
        matched += 1;
        let outcome = apply_update(target, update)?;
        if !outcome.modified {
            continue;
        }
        let id = outcome
            .document
            .get("_id")
            .cloned()
            .ok_or_else(|| CommandError::internal("stored document lost its _id"))?;
        with_retry(|| backend.update_document(database, collection, &id, &outcome.document))
            .await
            .map_err(map_backend_error)?;
        modified += 1;
    }
    Ok(UpdateStats {
        matched,
        modified,
        upserted_id: None,
    })
}

pub fn update<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "update")?;
        validate_namespace(&database, Some(&collection))?;
        let updates = request
            .get_array("updates")
            .map_err(|_| CommandError::bad_value("BSON field 'update.updates' is missing"))?;
        let ordered = request.get("ordered").map(bson_truthy).unwrap_or(true);

        let mut n = 0i32;
        let mut n_modified = 0i32;
        let mut upserted = Vec::new();
        let mut write_errors = Vec::new();
        for (index, entry) in updates.iter().enumerate() {
            match apply_single_update(cx, &database, &collection, entry).await {
                Ok(stats) => {
                    n += stats.matched;
                    n_modified += stats.modified;
                    if let Some(id) = stats.upserted_id {
                        n += 1;
                        upserted.push(Bson::Document(doc! {
                            "index": index as i32,
                            "_id": id,
                        }));
                    }
                }
                Err(error) => {
                    write_errors.push(write_error(index, &error));
                    if ordered {
                        break;
                    }
                }
            }
        }

        let mut reply = doc! { "n": n, "nModified": n_modified };
        if !upserted.is_empty() {
            reply.insert("upserted", Bson::Array(upserted));
        }
        if !write_errors.is_empty() {
            reply.insert(
                "writeErrors",
                Bson::Array(write_errors.into_iter().map(Bson::Document).collect()),
            );
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    })
}

async fn apply_single_delete(
    cx: &CommandContext<'_>,
    database: &str,
    collection: &str,
    entry: &Bson,
) -> CommandResult<i32> {
    let entry = entry
        .as_document()
        .ok_or_else(|| CommandError::type_mismatch("delete entries must be objects"))?;
    let query = entry
        .get_document("q")
        .map_err(|_| CommandError::type_mismatch("BSON field 'delete.deletes.q' is missing"))?;
    let limit = match entry.get("limit") {
        Some(Bson::Int32(0)) | Some(Bson::Int64(0)) => 0,
        Some(Bson::Int32(1)) | Some(Bson::Int64(1)) => 1,
        Some(Bson::Double(f)) if *f == 0.0 => 0,
        Some(Bson::Double(f)) if *f == 1.0 => 1,
        None => 0,
        Some(other) => {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                format!("The limit field in delete objects must be 0 or 1. Got {other}"),
            ))
        }
    };

    let backend = cx.backend;
    let matches = fetch_matching(backend, database, collection, query).await?;
    let targets: Vec<&Document> = if limit == 1 {
        matches.iter().take(1).collect()
    } else {
        matches.iter().collect()
    };
    let mut deleted = 0i32;
    for target in targets {
        let Some(id) = target.get("_id").cloned() else {
            continue;
        };
        match with_retry(|| backend.delete_document(database, collection, &id)).await {
            Ok(()) => deleted += 1,
            // A concurrent delete already removed it; the count just skips.
            Err(crate::backend::BackendError::NotFound(_)) => {}
            Err(other) => return Err(map_backend_error(other)),
        }
    }
    Ok(deleted)
}

pub fn delete<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "delete")?;
        validate_namespace(&database, Some(&collection))?;
        let deletes = request
            .get_array("deletes")
            .map_err(|_| CommandError::bad_value("BSON field 'delete.deletes' is missing"))?;
        let ordered = request.get("ordered").map(bson_truthy).unwrap_or(true);

        let mut n = 0i32;
        let mut write_errors = Vec::new();
        for (index, entry) in deletes.iter().enumerate() {
            match apply_single_delete(cx, &database, &collection, entry).await {
                Ok(deleted) => n += deleted,
                Err(error) => {
                    write_errors.push(write_error(index, &error));
                    if ordered {
                        break;
                    }
                }
            }
        }

        let mut reply = doc! { "n": n };
        if !write_errors.is_empty() {
            reply.insert(
                "writeErrors",
                Bson::Array(write_errors.into_iter().map(Bson::Document).collect()),
            );
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    })
}

pub fn find_and_modify<'a>(
    cx: &'a mut CommandContext<'_>,
    request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let command_key = request
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "findAndModify".to_string());
        let database = database_of(request)?;
        let collection = collection_of(request, &command_key)?;
        validate_namespace(&database, Some(&collection))?;

        let query = request
            .get_document("query")
            .map(Clone::clone)
            .unwrap_or_default();
        let remove = request.get("remove").map(bson_truthy).unwrap_or(false);
        let upsert = request.get("upsert").map(bson_truthy).unwrap_or(false);
        let return_new = request.get("new").map(bson_truthy).unwrap_or(false);
        let update_doc = match request.get("update") {
            Some(Bson::Document(update)) => Some(update.clone()),
            Some(_) => {
                return Err(CommandError::type_mismatch(
                    "BSON field 'findAndModify.update' is the wrong type",
                ))
            }
            None => None,
        };
        match (remove, &update_doc) {
            (true, Some(_)) | (false, None) => {
                return Err(CommandError::new(
                    ErrorCode::FailedToParse,
                    "Either an update or remove=true must be specified",
                ))
            }
            _ => {}
        }
        if remove && (upsert || return_new) {
            return Err(CommandError::new(
                ErrorCode::FailedToParse,
                "remove cannot be combined with upsert or new",
            ));
        }

        let backend = cx.backend;
        let mut matches = fetch_matching(backend, &database, &collection, &query).await?;
        if let Ok(sort) = request.get_document("sort") {
            sort_documents(&mut matches, sort)?;
        }
        let first = matches.into_iter().next();

        let projection = match request.get_document("fields") {
            Ok(fields) => Some(Projection::parse(fields)?),
            Err(_) => None,
        };
        let project = |doc: Document| -> Bson {
            match &projection {
                Some(p) => Bson::Document(p.apply(&doc)),
                None => Bson::Document(doc),
            }
        };

        if remove {
            return match first {
                Some(found) => {
                    let id = found
                        .get("_id")
                        .cloned()
                        .ok_or_else(|| CommandError::internal("stored document lost its _id"))?;
                    with_retry(|| backend.delete_document(&database, &collection, &id))
                        .await
                        .map_err(map_backend_error)?;
                    Ok(doc! {
                        "lastErrorObject": { "n": 1i32 },
                        "value": project(found),
                        "ok": 1.0,
                    })
                }
                None => Ok(doc! {
                    "lastErrorObject": { "n": 0i32 },
                    "value": Bson::Null,
                    "ok": 1.0,
                }),
            };
        }

        let update_doc = update_doc.expect("checked above");
        match first {
            Some(found) => {
                let outcome = apply_update(&found, &update_doc)?;
                if outcome.modified {
                    let id = outcome
                        .document
                        .get("_id")
                        .cloned()
                        .ok_or_else(|| CommandError::internal("stored document lost its _id"))?;
                    with_retry(|| {
                        backend.update_document(&database, &collection, &id, &outcome.document)
                    })
                    .await
                    .map_err(map_backend_error)?;
                }
                let value = if return_new {
                    project(outcome.document)
                } else {
                    project(found)
                };
                Ok(doc! {
                    "lastErrorObject": { "n": 1i32, "updatedExisting": true },
                    "value": value,
                    "ok": 1.0,
                })
            }
            None if upsert => {
                let outcome = apply_update(&upsert_base(&query), &update_doc)?;
                let inserted = ensure_id(&outcome.document);
                let id = inserted.get("_id").cloned().expect("ensure_id");
                with_retry(|| backend.create_collection_if_not_exists(&database, &collection))
                    .await
                    .map_err(map_backend_error)?;
                with_retry(|| backend.insert_document(&database, &collection, &inserted))
                    .await
                    .map_err(map_backend_error)?;
                let value = if return_new {
                    project(inserted)
                } else {
                    Bson::Null
                };
                Ok(doc! {
                    "lastErrorObject": {
                        "n": 1i32,
                        "updatedExisting": false,
                        "upserted": id,
                    },
                    "value": value,
                    "ok": 1.0,
                })
            }
            None => Ok(doc! {
                "lastErrorObject": { "n": 0i32, "updatedExisting": false },
                "value": Bson::Null,
                "ok": 1.0,
            }),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_id_prepends() {
        let prepared = ensure_id(&doc! {"a": 1});
        let mut keys = prepared.keys();
        assert_eq!(keys.next().unwrap(), "_id");
        assert_eq!(keys.next().unwrap(), "a");
        // Existing ids survive untouched.
        let kept = ensure_id(&doc! {"_id": 7, "a": 1});
        assert_eq!(kept.get_i32("_id").unwrap(), 7);
    }

    #[test]
    fn upsert_base_extracts_equalities() {
        let base = upsert_base(&doc! {
            "a": 1,
            "b": {"$eq": 2},
            "c": {"$gt": 5},
            "d.e": 9,
            "$comment": "x",
        });
        assert_eq!(base, doc! {"a": 1, "b": 2});
    }

    #[test]
    fn write_error_shape() {
        let err = CommandError::new(ErrorCode::DuplicateKey, "E11000");
        let entry = write_error(3, &err);
        assert_eq!(entry.get_i32("index").unwrap(), 3);
        assert_eq!(entry.get_i32("code").unwrap(), 11000);
    }
}
