/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FerroDB - MongoDB wire-compatible proxy for PostgreSQL
 * Built with Rust for superior performance and reliability
 *
 * @file commands.rs
 * @brief Command dispatch table and shared handler plumbing
 */

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::{Bson, Document};
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError, BackendResult, NamespaceKind};
use crate::config::Config;
use crate::error::{CommandError, CommandResult, ErrorCode};
use crate::session::Session;
use crate::wire_protocol::DocumentSequence;
use crate::{commands_admin, commands_ddl, commands_query, commands_write};

const RETRY_ATTEMPTS: u32 = 3;

/// Process-wide state shared by every connection.
pub struct ServerState {
    pub config: Config,
    pub start_time: Instant,
    pub current_connections: AtomicI64,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            current_connections: AtomicI64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        self.start_time.elapsed().as_secs() as i64
    }

    pub fn connection_count(&self) -> i64 {
        self.current_connections.load(Ordering::Relaxed)
    }
}

/// Everything a handler can touch: the backend, the connection's state, and
/// process-wide info.
pub struct CommandContext<'a> {
    pub backend: &'a dyn Backend,
    pub session: &'a mut Session,
    pub server: &'a ServerState,
}

pub type HandlerFuture<'a> = BoxFuture<'a, CommandResult<Document>>;
pub type Handler = for<'a, 'b> fn(&'a mut CommandContext<'b>, &'a Document) -> HandlerFuture<'a>;

/// String-keyed dispatch table. Built once at startup and passed to every
/// connection loop; there is no global registration state.
pub struct CommandTable {
    handlers: HashMap<&'static str, Handler>,
}

impl CommandTable {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();

        // Diagnostics and handshake
        handlers.insert("hello", commands_admin::hello);
        handlers.insert("isMaster", commands_admin::is_master);
        handlers.insert("ismaster", commands_admin::is_master);
        handlers.insert("buildInfo", commands_admin::build_info);
        handlers.insert("buildinfo", commands_admin::build_info);
        handlers.insert("ping", commands_admin::ping);
        handlers.insert("whatsmyuri", commands_admin::whatsmyuri);
        handlers.insert("getCmdLineOpts", commands_admin::get_cmd_line_opts);
        handlers.insert("getLog", commands_admin::get_log);
        handlers.insert("serverStatus", commands_admin::server_status);
        handlers.insert("connectionStatus", commands_admin::connection_status);
        handlers.insert("dbStats", commands_admin::db_stats);
        handlers.insert("collStats", commands_admin::coll_stats);

        // Databases, collections, indexes
        handlers.insert("listDatabases", commands_ddl::list_databases);
        handlers.insert("listCollections", commands_ddl::list_collections);
        handlers.insert("listIndexes", commands_ddl::list_indexes);
        handlers.insert("create", commands_ddl::create);
        handlers.insert("drop", commands_ddl::drop);
        handlers.insert("dropDatabase", commands_ddl::drop_database);
        handlers.insert("createIndexes", commands_ddl::create_indexes);
        handlers.insert("dropIndexes", commands_ddl::drop_indexes);

        // Writes
        handlers.insert("insert", commands_write::insert);
        handlers.insert("update", commands_write::update);
        handlers.insert("delete", commands_write::delete);
        handlers.insert("findAndModify", commands_write::find_and_modify);
        handlers.insert("findandmodify", commands_write::find_and_modify);

        // Queries and cursors
        handlers.insert("find", commands_query::find);
        handlers.insert("count", commands_query::count);
        handlers.insert("distinct", commands_query::distinct);
        handlers.insert("aggregate", commands_query::aggregate);
        handlers.insert("getMore", commands_query::get_more);
        handlers.insert("killCursors", commands_query::kill_cursors);

        Self { handlers }
    }

    /// Dispatch on the first field of the command document, case-sensitively.
    /// The reply is always a full document; command errors never close the
    /// connection.
    pub async fn execute(&self, cx: &mut CommandContext<'_>, request: &Document) -> Document {
        let Some(command_name) = request.keys().next().cloned() else {
            return CommandError::bad_value("no command specified").to_document();
        };
        let result = match self.handlers.get(command_name.as_str()) {
            Some(handler) => self.run_with_deadline(*handler, cx, request).await,
            None => Err(CommandError::new(
                ErrorCode::CommandNotFound,
                format!("no such command: '{command_name}'"),
            )),
        };
        match result {
            Ok(mut reply) => {
                cx.session.clear_error();
                if !reply.contains_key("ok") {
                    reply.insert("ok", 1.0);
                }
                reply
            }
            Err(error) => {
                warn!(command = command_name.as_str(), %error, "command failed");
                cx.session.record_error(&error);
                error.to_document()
            }
        }
    }

    // maxTimeMS wraps the handler in a deadline derived from the connection.
    async fn run_with_deadline(
        &self,
        handler: Handler,
        cx: &mut CommandContext<'_>,
        request: &Document,
    ) -> CommandResult<Document> {
        let max_time_ms = match request.get("maxTimeMS") {
            None => None,
            Some(Bson::Int32(ms)) if *ms >= 0 => Some(*ms as u64),
            Some(Bson::Int64(ms)) if *ms >= 0 => Some(*ms as u64),
            Some(Bson::Double(ms)) if *ms >= 0.0 && ms.fract() == 0.0 => Some(*ms as u64),
            Some(other) => {
                return Err(CommandError::bad_value(format!(
                    "maxTimeMS must be a non-negative integer, got {other}"
                )))
            }
        };
        match max_time_ms {
            None | Some(0) => handler(cx, request).await,
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), handler(cx, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(CommandError::new(
                        ErrorCode::MaxTimeMsExpired,
                        "operation exceeded time limit",
                    )),
                }
            }
        }
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold OP_MSG kind-1 document sequences into the command document under
/// their identifiers, the shape handlers expect.
pub fn merge_sequences(mut request: Document, sequences: Vec<DocumentSequence>) -> Document {
    for sequence in sequences {
        if request.get(&sequence.identifier).is_none() {
            let docs: Vec<Bson> = sequence
                .documents
                .into_iter()
                .map(Bson::Document)
                .collect();
            request.insert(sequence.identifier, Bson::Array(docs));
        }
    }
    request
}

/// `$db` names the database in OP_MSG; the legacy handshake path defaults
/// to admin.
pub fn database_of(request: &Document) -> CommandResult<String> {
    match request.get("$db") {
        None => Ok("admin".to_string()),
        Some(Bson::String(db)) => Ok(db.clone()),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "BSON field '$db' is the wrong type '{}', expected type 'string'",
            crate::value::type_alias(other)
        ))),
    }
}

/// The collection argument is the value of the command's first field.
pub fn collection_of(request: &Document, command: &str) -> CommandResult<String> {
    match request.get(command) {
        Some(Bson::String(name)) => Ok(name.clone()),
        Some(other) => Err(CommandError::type_mismatch(format!(
            "collection name has invalid type {}",
            crate::value::type_alias(other)
        ))),
        None => Err(CommandError::bad_value(format!(
            "BSON field '{command}' is missing"
        ))),
    }
}

/// Map a classified backend failure onto its MongoDB error. `Retryable` only
/// reaches this after the retry budget is spent.
pub fn map_backend_error(error: BackendError) -> CommandError {
    match error {
        BackendError::NotFound(NamespaceKind::Database | NamespaceKind::Collection) => {
            CommandError::new(ErrorCode::NamespaceNotFound, "ns not found")
        }
        BackendError::NotFound(NamespaceKind::Index) => {
            CommandError::new(ErrorCode::IndexNotFound, "index not found")
        }
        BackendError::NotFound(NamespaceKind::Document) => {
            CommandError::internal("document vanished mid-operation")
        }
        BackendError::AlreadyExists(NamespaceKind::Index) => CommandError::new(
            ErrorCode::IndexOptionsConflict,
            "an index with that name already exists with different options",
        ),
        BackendError::AlreadyExists(_) => {
            CommandError::new(ErrorCode::NamespaceExists, "Collection already exists.")
        }
        BackendError::DuplicateKey => CommandError::new(
            ErrorCode::DuplicateKey,
            "E11000 duplicate key error",
        ),
        BackendError::InvalidName(message) => {
            CommandError::new(ErrorCode::InvalidNamespace, message)
        }
        BackendError::Retryable(message) => CommandError::new(
            ErrorCode::WriteConflict,
            format!("write conflict after retries: {message}"),
        ),
        BackendError::Unclassified(message) => CommandError::internal(message),
    }
}

/// Run a backend operation, retrying serialization/deadlock failures with a
/// short exponential backoff before surfacing WriteConflict.
pub async fn with_retry<T, F, Fut>(mut operation: F) -> BackendResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Err(error) if error.is_retryable() && attempt < RETRY_ATTEMPTS => {
                attempt += 1;
                let backoff = Duration::from_millis(1 << attempt.min(4));
                debug!(attempt, ?backoff, "retrying after transient backend failure");
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

/// Query a collection and return exactly the documents matching `filter`.
/// When the backend reports a partial pushdown the full filter is re-run in
/// memory, so the union of both passes equals a full evaluation.
pub async fn fetch_matching(
    backend: &dyn Backend,
    database: &str,
    collection: &str,
    filter: &Document,
) -> CommandResult<Vec<Document>> {
    let params = crate::backend::QueryParams {
        filter: filter.clone(),
        limit: None,
    };
    let result = match backend.query_documents(database, collection, &params).await {
        Ok(result) => result,
        // Querying a namespace that does not exist matches nothing.
        Err(BackendError::NotFound(
            NamespaceKind::Database | NamespaceKind::Collection,
        )) => {
            return Ok(Vec::new());
        }
        Err(other) => return Err(map_backend_error(other)),
    };
    if result.pushdown_complete {
        return Ok(result.documents);
    }
    let mut matching = Vec::with_capacity(result.documents.len());
    for document in result.documents {
        if crate::filter::matches(&document, filter)? {
            matching.push(document);
        }
    }
    Ok(matching)
}

/// Build the standard cursor reply, registering a server-side cursor when
/// the result does not fit the first batch.
pub fn cursor_reply(
    session: &mut Session,
    database: &str,
    collection: &str,
    namespace: String,
    mut documents: Vec<Document>,
    batch_size: usize,
) -> Document {
    let (cursor_id, first_batch) = if documents.len() > batch_size {
        let remaining = documents.split_off(batch_size);
        let id = session.cursors.create(database, collection, remaining);
        (id, documents)
    } else {
        (0, documents)
    };
    let batch: Vec<Bson> = first_batch.into_iter().map(Bson::Document).collect();
    bson::doc! {
        "cursor": {
            "firstBatch": batch,
            "id": cursor_id,
            "ns": namespace,
        },
        "ok": 1.0,
    }
}

/// Effective batch size for cursor-returning commands.
pub fn batch_size_of(request: &Document, default: u32) -> CommandResult<usize> {
    let value = match request.get("batchSize") {
        Some(v) => Some(v),
        None => match request.get("cursor") {
            Some(Bson::Document(options)) => options.get("batchSize"),
            _ => None,
        },
    };
    match value {
        None => Ok(default as usize),
        Some(Bson::Int32(n)) if *n >= 0 => Ok(*n as usize),
        Some(Bson::Int64(n)) if *n >= 0 => Ok(*n as usize),
        Some(Bson::Double(n)) if *n >= 0.0 => Ok(*n as usize),
        Some(_) => Err(CommandError::bad_value(
            "BSON field 'batchSize' value must be >= 0",
        )),
    }
}

/// Validate database and collection names before any backend call.
pub fn validate_namespace(database: &str, collection: Option<&str>) -> CommandResult<()> {
    crate::backend::validate_database_name(database).map_err(map_backend_error)?;
    if let Some(collection) = collection {
        crate::backend::validate_collection_name(collection).map_err(map_backend_error)?;
    }
    Ok(())
}

/// Shared by every backend consumer: an `Arc<dyn Backend>` as the server
/// holds it.
pub type SharedBackend = Arc<dyn Backend>;
