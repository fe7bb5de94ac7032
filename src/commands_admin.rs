/*!
 * @file commands_admin.rs
 * @brief Diagnostic and handshake command handlers
 */

use bson::{doc, Bson, Document};

use crate::commands::{database_of, CommandContext, HandlerFuture};
use crate::error::{CommandError, ErrorCode};

pub const MAX_BSON_OBJECT_SIZE: i32 = 16 * 1024 * 1024;
pub const MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;
pub const MAX_WRITE_BATCH_SIZE: i32 = 100_000;
const MAX_WIRE_VERSION: i32 = 17;

fn handshake(cx: &CommandContext<'_>, primary_field: &str) -> Document {
    let mut reply = Document::new();
    reply.insert(primary_field.to_string(), true);
    reply.insert("maxBsonObjectSize", MAX_BSON_OBJECT_SIZE);
    reply.insert("maxMessageSizeBytes", MAX_MESSAGE_SIZE_BYTES);
    reply.insert("maxWriteBatchSize", MAX_WRITE_BATCH_SIZE);
    reply.insert("localTime", Bson::DateTime(bson::DateTime::now()));
    reply.insert("logicalSessionTimeoutMinutes", 30i32);
    reply.insert("connectionId", cx.session.connection_id as i64);
    reply.insert("minWireVersion", 0i32);
    reply.insert("maxWireVersion", MAX_WIRE_VERSION);
    reply.insert("readOnly", false);
    reply.insert("ok", 1.0);
    reply
}

pub fn hello<'a>(cx: &'a mut CommandContext<'_>, _request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(handshake(cx, "isWritablePrimary")) })
}

pub fn is_master<'a>(cx: &'a mut CommandContext<'_>, _request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(handshake(cx, "ismaster")) })
}

pub fn build_info<'a>(_cx: &'a mut CommandContext<'_>, _request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(doc! {
            "version": "7.0.0",
            "gitVersion": format!("ferrodb-{}", env!("CARGO_PKG_VERSION")),
            "versionArray": [7i32, 0i32, 0i32, 0i32],
            "modules": Bson::Array(vec![]),
            "sysInfo": "deprecated",
            "bits": 64i32,
            "debug": false,
            "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE,
            "buildEnvironment": {},
            "ferrodb": { "version": env!("CARGO_PKG_VERSION") },
            "ok": 1.0,
        })
    })
}

pub fn ping<'a>(_cx: &'a mut CommandContext<'_>, _request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(doc! { "ok": 1.0 }) })
}

pub fn whatsmyuri<'a>(cx: &'a mut CommandContext<'_>, _request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(doc! {
            "you": cx.session.peer_addr.clone(),
            "ok": 1.0,
        })
    })
}

pub fn get_cmd_line_opts<'a>(
    _cx: &'a mut CommandContext<'_>,
    _request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(doc! {
            "argv": ["ferrodb"],
            "parsed": {},
            "ok": 1.0,
        })
    })
}

pub fn get_log<'a>(_cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        match request.get("getLog") {
            Some(Bson::String(kind)) if kind == "startupWarnings" => {
                let line = format!(
                    "{{\"t\":{{\"$date\":\"{}\"}},\"s\":\"I\",\"c\":\"STORAGE\",\"id\":42000,\"ctx\":\"ferrodb\",\"msg\":\"Powered by FerroDB {}\"}}",
                    chrono::Utc::now().to_rfc3339(),
                    env!("CARGO_PKG_VERSION"),
                );
                Ok(doc! {
                    "totalLinesWritten": 1i32,
                    "log": [line],
                    "ok": 1.0,
                })
            }
            Some(Bson::String(kind)) if kind == "*" => Ok(doc! {
                "names": ["startupWarnings"],
                "ok": 1.0,
            }),
            Some(Bson::String(kind)) => Err(CommandError::bad_value(format!(
                "no RamLog named: {kind}"
            ))),
            _ => Err(CommandError::type_mismatch(
                "BSON field 'getLog' is the wrong type, expected type 'string'",
            )),
        }
    })
}

pub fn server_status<'a>(
    cx: &'a mut CommandContext<'_>,
    _request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let uptime = cx.server.uptime_seconds();
        let current = cx.server.connection_count();
        let available = i64::from(cx.server.config.server.max_connections) - current;
        Ok(doc! {
            "host": cx.server.config.listen_addr(),
            "version": "7.0.0",
            "process": "ferrodb",
            "pid": i64::from(std::process::id()),
            "uptime": uptime as f64,
            "uptimeMillis": uptime * 1000,
            "uptimeEstimate": uptime,
            "localTime": Bson::DateTime(bson::DateTime::now()),
            "connections": {
                "current": current,
                "available": available.max(0),
                "totalCreated": cx.session.connection_id as i64,
            },
            "ok": 1.0,
        })
    })
}

pub fn connection_status<'a>(
    _cx: &'a mut CommandContext<'_>,
    _request: &'a Document,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(doc! {
            "authInfo": {
                "authenticatedUsers": Bson::Array(vec![]),
                "authenticatedUserRoles": Bson::Array(vec![]),
            },
            "ok": 1.0,
        })
    })
}

pub fn db_stats<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let stats = match cx.backend.database_stats(&database).await {
            Ok(stats) => stats,
            // A database that does not exist yet reports empty stats.
            Err(crate::backend::BackendError::NotFound(_)) => Default::default(),
            Err(other) => return Err(crate::commands::map_backend_error(other)),
        };
        let avg_obj_size = if stats.objects > 0 {
            stats.size_bytes as f64 / stats.objects as f64
        } else {
            0.0
        };
        Ok(doc! {
            "db": database,
            "collections": stats.collections,
            "objects": stats.objects,
            "avgObjSize": avg_obj_size,
            "dataSize": stats.size_bytes as f64,
            "storageSize": stats.size_bytes as f64,
            "indexes": 0i32,
            "indexSize": 0.0,
            "ok": 1.0,
        })
    })
}

pub fn coll_stats<'a>(cx: &'a mut CommandContext<'_>, request: &'a Document) -> HandlerFuture<'a> {
    Box::pin(async move {
        let database = database_of(request)?;
        let collection = crate::commands::collection_of(request, "collStats")?;
        let stats = match cx.backend.collection_stats(&database, &collection).await {
            Ok(stats) => stats,
            Err(crate::backend::BackendError::NotFound(_)) => Default::default(),
            Err(other) => return Err(crate::commands::map_backend_error(other)),
        };
        Ok(doc! {
            "ns": format!("{database}.{collection}"),
            "count": stats.count,
            "size": stats.size_bytes as f64,
            "storageSize": stats.size_bytes as f64,
            "totalIndexSize": 0.0,
            "ok": 1.0,
        })
    })
}
