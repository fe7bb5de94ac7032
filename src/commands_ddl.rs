/*!
 * @file commands_ddl.rs
 * @brief Database, collection and index administration handlers
 */

use bson::{doc, Bson, Document};

use crate::backend::{BackendError, IndexKey, IndexSpec};
use crate::commands::{
    batch_size_of, collection_of, cursor_reply, database_of, map_backend_error, validate_namespace,
    CommandContext, HandlerFuture,
};
use crate::error::{CommandError, CommandResult, ErrorCode};
use crate::filter::bson_truthy;

pub fn list_databases<'a>(
    cx: &'a mut CommandContext<'_>,
    request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let names = cx
            .backend
            .list_databases()
            .await
            .map_err(map_backend_error)?;
        let name_only = request
            .get("nameOnly")
            .map(bson_truthy)
            .unwrap_or(false);
        let mut databases = Vec::with_capacity(names.len());
        let mut total_size = 0i64;
        for name in names {
            if name_only {
                databases.push(Bson::Document(doc! { "name": name }));
                continue;
            }
            let stats = cx
                .backend
                .database_stats(&name)
                .await
                .unwrap_or_default();
            total_size += stats.size_bytes;
            databases.push(Bson::Document(doc! {
                "name": name,
                "sizeOnDisk": stats.size_bytes,
                "empty": stats.objects == 0,
            }));
        }
        let mut reply = doc! { "databases": Bson::Array(databases) };
        if !name_only {
            reply.insert("totalSize", total_size);
            reply.insert("totalSizeMb", total_size / (1024 * 1024));
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    })
}

pub fn list_collections<'a>(
    cx: &'a mut CommandContext<'_>,
    request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let names = match cx.backend.list_collections(&database).await {
            Ok(names) => names,
            // Listing a database that does not exist yields an empty batch.
            Err(BackendError::NotFound(_)) => Vec::new(),
            Err(other) => return Err(map_backend_error(other)),
        };
        let docs: Vec<Document> = names
            .into_iter()
            .map(|name| {
                doc! {
                    "name": name,
                    "type": "collection",
                    "options": {},
                    "info": { "readOnly": false },
                    "idIndex": IndexSpec::id_index().to_document(),
                }
            })
            .collect();
        let batch = batch_size_of(
            request,
            cx.server.config.cursors.default_batch_size,
        )?;
        let namespace = format!("{database}.$cmd.listCollections");
        Ok(cursor_reply(
            cx.session,
            &database,
            "$cmd.listCollections",
            namespace,
            docs,
            batch,
        ))
    })
}

pub fn list_indexes<'a>(
    cx: &'a mut CommandContext<'_>,
    request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "listIndexes")?;
        let indexes = cx
            .backend
            .list_indexes(&database, &collection)
            .await
            .map_err(map_backend_error)?;
        let docs: Vec<Document> = indexes.iter().map(IndexSpec::to_document).collect();
        let batch = batch_size_of(
            request,
            cx.server.config.cursors.default_batch_size,
        )?;
        let namespace = format!("{database}.$cmd.listIndexes.{collection}");
        Ok(cursor_reply(
            cx.session,
            &database,
            &collection,
            namespace,
            docs,
            batch,
        ))
    })
}

pub fn create<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "create")?;
        validate_namespace(&database, Some(&collection))?;
        cx.backend
            .create_database_if_not_exists(&database)
            .await
            .map_err(map_backend_error)?;
        cx.backend
            .create_collection(&database, &collection)
            .await
            .map_err(|e| match e {
                BackendError::AlreadyExists(_) => CommandError::new(
                    ErrorCode::NamespaceExists,
                    format!("Collection {database}.{collection} already exists."),
                ),
                other => map_backend_error(other),
            })?;
        Ok(doc! { "ok": 1.0 })
    })
}

pub fn drop<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "drop")?;
        let n_indexes = cx
            .backend
            .list_indexes(&database, &collection)
            .await
            .map(|v| v.len() as i32)
            .unwrap_or(1);
        cx.backend
            .drop_collection(&database, &collection)
            .await
            .map_err(map_backend_error)?;
        Ok(doc! {
            "nIndexesWas": n_indexes,
            "ns": format!("{database}.{collection}"),
            "ok": 1.0,
        })
    })
}

pub fn drop_database<'a>(
    cx: &'a mut CommandContext<'_>,
    request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        validate_namespace(&database, None)?;
        match cx.backend.drop_database(&database).await {
            Ok(()) => Ok(doc! { "dropped": database, "ok": 1.0 }),
            // Dropping a database that never existed is still a success.
            Err(BackendError::NotFound(_)) => Ok(doc! { "ok": 1.0 }),
            Err(other) => Err(map_backend_error(other)),
        }
    })
}

fn parse_index_spec(value: &Bson) -> CommandResult<IndexSpec> {
    let spec = value
        .as_document()
        .ok_or_else(|| CommandError::type_mismatch("each index spec must be an object"))?;
    let key = spec
        .get_document("key")
        .map_err(|_| CommandError::bad_value("index spec is missing the 'key' field"))?;
    if key.is_empty() {
        return Err(CommandError::bad_value("index key cannot be empty"));
    }
    let name = spec
        .get_str("name")
        .map_err(|_| CommandError::bad_value("index spec is missing the 'name' field"))?;
    let mut keys = Vec::with_capacity(key.len());
    for (field, direction) in key.iter() {
        let descending = match direction {
            Bson::Int32(1) | Bson::Int64(1) => false,
            Bson::Int32(-1) | Bson::Int64(-1) => true,
            Bson::Double(f) if *f == 1.0 => false,
            Bson::Double(f) if *f == -1.0 => true,
            other => {
                return Err(CommandError::bad_value(format!(
                    "unsupported index direction for '{field}': {other}"
                )))
            }
        };
        keys.push(IndexKey {
            field: field.clone(),
            descending,
        });
    }
    let unique = spec.get("unique").map(bson_truthy).unwrap_or(false);
    Ok(IndexSpec {
        name: name.to_string(),
        keys,
        unique,
    })
}

pub fn create_indexes<'a>(
    cx: &'a mut CommandContext<'_>,
    request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "createIndexes")?;
        validate_namespace(&database, Some(&collection))?;
        let specs = request
            .get_array("indexes")
            .map_err(|_| CommandError::bad_value("BSON field 'indexes' is missing"))?;
        if specs.is_empty() {
            return Err(CommandError::bad_value(
                "Must specify at least one index to create",
            ));
        }
        let parsed: Vec<IndexSpec> = specs
            .iter()
            .map(parse_index_spec)
            .collect::<CommandResult<_>>()?;

        let existed_before = cx.backend.list_indexes(&database, &collection).await;
        let created_collection = existed_before.is_err();
        if created_collection {
            cx.backend
                .create_collection_if_not_exists(&database, &collection)
                .await
                .map_err(map_backend_error)?;
        }
        let before = match &existed_before {
            Ok(indexes) => indexes.len() as i32,
            Err(_) => 1,
        };
        let mut after = before;
        for spec in &parsed {
            let created = cx
                .backend
                .create_index(&database, &collection, spec)
                .await
                .map_err(map_backend_error)?;
            if created {
                after += 1;
            }
        }
        let mut reply = doc! {
            "numIndexesBefore": before,
            "numIndexesAfter": after,
        };
        if created_collection {
            reply.insert("createdCollectionAutomatically", true);
        }
        if after == before {
            reply.insert("note", "all indexes already exist");
        }
        reply.insert("ok", 1.0);
        Ok(reply)
    })
}

pub fn drop_indexes<'a>(
    cx: &'a mut CommandContext<'_>,
    request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = collection_of(request, "dropIndexes")?;
        let existing = cx
            .backend
            .list_indexes(&database, &collection)
            .await
            .map_err(map_backend_error)?;
        let n_indexes_was = existing.len() as i32;

        let targets: Vec<String> = match request.get("index") {
            Some(Bson::String(name)) if name == "*" => existing
                .iter()
                .filter(|index| index.name != "_id_")
                .map(|index| index.name.clone())
                .collect(),
            Some(Bson::String(name)) => vec![name.clone()],
            Some(Bson::Array(names)) => names
                .iter()
                .map(|value| {
                    value
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| CommandError::type_mismatch("index names must be strings"))
                })
                .collect::<CommandResult<_>>()?,
            Some(Bson::Document(key_pattern)) => {
                let found = existing.iter().find(|index| {
                    index.to_document().get_document("key").ok() == Some(key_pattern)
                });
                match found {
                    Some(index) => vec![index.name.clone()],
                    None => {
                        return Err(CommandError::new(
                            ErrorCode::IndexNotFound,
                            format!("can't find index with key: {key_pattern}"),
                        ))
                    }
                }
            }
            _ => {
                return Err(CommandError::bad_value(
                    "BSON field 'index' is missing or has the wrong type",
                ))
            }
        };

        for name in &targets {
            if name == "_id_" {
                return Err(CommandError::new(
                    ErrorCode::IllegalOperation,
                    "cannot drop _id index",
                ));
            }
            cx.backend
                .drop_index(&database, &collection, name)
                .await
                .map_err(|e| match e {
                    BackendError::NotFound(crate::backend::NamespaceKind::Index) => {
                        CommandError::new(
                            ErrorCode::IndexNotFound,
                            format!("index not found with name [{name}]"),
                        )
                    }
                    other => map_backend_error(other),
                })?;
        }
        Ok(doc! { "nIndexesWas": n_indexes_was, "ok": 1.0 })
    })
}
