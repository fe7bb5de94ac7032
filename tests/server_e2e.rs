//! End-to-end tests: a spawned server, a raw TCP client, hand-framed OP_MSG.
//! The in-memory backend stands in for PostgreSQL so the full wire path runs
//! without external services.

use std::net::SocketAddr;
use std::sync::Arc;

use bson::{doc, Bson, Document};
use ferrodb::config::Config;
use ferrodb::server::Server;
use ferrodb::shutdown::ShutdownHandle;
use ferrodb::wire_protocol::{
    decode_op_msg, encode_op_msg, MessageHeader, HEADER_LEN, OP_MSG, OP_REPLY,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[path = "common/mem_backend.rs"]
mod mem_backend;
use mem_backend::MemBackend;

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    next_request_id: i32,
}

impl TestServer {
    async fn start() -> Self {
        let mut config = Config::default();
        config.server.port = 0;
        config.server.host = "127.0.0.1".to_string();
        let (addr, shutdown, _task) =
            Server::spawn_with_shutdown(config, Arc::new(MemBackend::new()))
                .await
                .expect("server spawn");
        Self {
            addr,
            shutdown,
            next_request_id: 0,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect")
    }

    async fn command(&mut self, stream: &mut TcpStream, command: Document) -> Document {
        self.next_request_id += 1;
        let msg = encode_op_msg(&command, self.next_request_id, 0).expect("encode");
        stream.write_all(&msg).await.expect("write");
        read_reply(stream).await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

async fn read_reply(stream: &mut TcpStream) -> Document {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.expect("read header");
    let header = MessageHeader::parse(&header);
    assert_eq!(header.op_code, OP_MSG);
    let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
    stream.read_exact(&mut body).await.expect("read body");
    decode_op_msg(&body).expect("decode").document
}

fn assert_ok(reply: &Document) {
    assert_eq!(
        reply.get_f64("ok").unwrap_or(0.0),
        1.0,
        "expected ok reply, got {reply:?}"
    );
}

fn error_code(reply: &Document) -> i32 {
    assert_eq!(reply.get_f64("ok").unwrap_or(1.0), 0.0, "expected error, got {reply:?}");
    reply.get_i32("code").expect("error code")
}

fn first_batch(reply: &Document) -> Vec<Document> {
    reply
        .get_document("cursor")
        .expect("cursor")
        .get_array("firstBatch")
        .expect("firstBatch")
        .iter()
        .map(|b| b.as_document().expect("document").clone())
        .collect()
}

fn next_batch(reply: &Document) -> Vec<Document> {
    reply
        .get_document("cursor")
        .expect("cursor")
        .get_array("nextBatch")
        .expect("nextBatch")
        .iter()
        .map(|b| b.as_document().expect("document").clone())
        .collect()
}

fn cursor_id(reply: &Document) -> i64 {
    reply
        .get_document("cursor")
        .expect("cursor")
        .get_i64("id")
        .expect("cursor id")
}

#[tokio::test]
async fn handshake_over_op_msg_and_op_query() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(&mut stream, doc! { "hello": 1i32, "$db": "admin" })
        .await;
    assert_ok(&reply);
    assert!(reply.get_bool("isWritablePrimary").unwrap());
    assert!(reply.get_i32("maxWireVersion").unwrap() >= 13);

    // Legacy handshake path: OP_QUERY against admin.$cmd gets an OP_REPLY.
    let query = doc! { "isMaster": 1i32 };
    let query_bytes = bson::to_vec(&query).unwrap();
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(b"admin.$cmd\0");
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(&(-1i32).to_le_bytes());
    body.extend_from_slice(&query_bytes);
    let mut msg = Vec::new();
    MessageHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id: 99,
        response_to: 0,
        op_code: 2004,
    }
    .write_to(&mut msg);
    msg.extend_from_slice(&body);
    stream.write_all(&msg).await.unwrap();

    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let header = MessageHeader::parse(&header);
    assert_eq!(header.op_code, OP_REPLY);
    assert_eq!(header.response_to, 99);
    let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
    stream.read_exact(&mut body).await.unwrap();
    // Skip responseFlags/cursorID/startingFrom/numberReturned.
    let reply =
        Document::from_reader(&mut std::io::Cursor::new(&body[20..])).expect("reply document");
    assert!(reply.get_bool("ismaster").unwrap());
}

#[tokio::test]
async fn unknown_command_keeps_connection_alive() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(&mut stream, doc! { "frobnicate": 1i32, "$db": "test" })
        .await;
    assert_eq!(error_code(&reply), 59);
    assert_eq!(reply.get_str("codeName").unwrap(), "CommandNotFound");

    let reply = server
        .command(&mut stream, doc! { "ping": 1i32, "$db": "admin" })
        .await;
    assert_ok(&reply);
}

#[tokio::test]
async fn reserved_database_name_is_rejected() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(
            &mut stream,
            doc! {
                "insert": "x",
                "documents": [{ "a": 1i32 }],
                "$db": "_ferretdb_x",
            },
        )
        .await;
    assert_eq!(error_code(&reply), 73);
    assert_eq!(reply.get_str("codeName").unwrap(), "InvalidNamespace");

    // The backing store's default namespace cannot become a database.
    let reply = server
        .command(
            &mut stream,
            doc! {
                "insert": "x",
                "documents": [{ "a": 1i32 }],
                "$db": "public",
            },
        )
        .await;
    assert_eq!(error_code(&reply), 73);

    // No database was created on the way.
    let reply = server
        .command(&mut stream, doc! { "listDatabases": 1i32, "$db": "admin" })
        .await;
    assert_ok(&reply);
    assert!(reply.get_array("databases").unwrap().is_empty());
}

#[tokio::test]
async fn insert_creates_database_and_collection_implicitly() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    for value in [1i32, 2i32] {
        let reply = server
            .command(
                &mut stream,
                doc! {
                    "insert": "b",
                    "documents": [{ "v": value }],
                    "$db": "a",
                },
            )
            .await;
        assert_ok(&reply);
        assert_eq!(reply.get_i32("n").unwrap(), 1);
    }

    let reply = server
        .command(&mut stream, doc! { "listCollections": 1i32, "$db": "a" })
        .await;
    assert_ok(&reply);
    let collections = first_batch(&reply);
    assert_eq!(collections.len(), 1);
    assert_eq!(collections[0].get_str("name").unwrap(), "b");

    let reply = server
        .command(&mut stream, doc! { "find": "b", "$db": "a" })
        .await;
    assert_ok(&reply);
    assert_eq!(first_batch(&reply).len(), 2);
}

#[tokio::test]
async fn duplicate_id_reports_write_error_and_keeps_first() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(
            &mut stream,
            doc! {
                "insert": "c",
                "documents": [{ "_id": 1i32, "x": 1i32 }],
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);

    let reply = server
        .command(
            &mut stream,
            doc! {
                "insert": "c",
                "documents": [{ "_id": 1i32, "x": 2i32 }],
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("n").unwrap(), 0);
    let errors = reply.get_array("writeErrors").unwrap();
    assert_eq!(errors.len(), 1);
    let error = errors[0].as_document().unwrap();
    assert_eq!(error.get_i32("index").unwrap(), 0);
    assert_eq!(error.get_i32("code").unwrap(), 11000);

    let reply = server
        .command(
            &mut stream,
            doc! { "find": "c", "filter": { "_id": 1i32 }, "$db": "test" },
        )
        .await;
    let docs = first_batch(&reply);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get_i32("x").unwrap(), 1);
}

#[tokio::test]
async fn conflicting_update_operators_leave_document_unchanged() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(
            &mut stream,
            doc! {
                "insert": "u",
                "documents": [{ "_id": 1i32, "n": 1i32 }],
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);

    let reply = server
        .command(
            &mut stream,
            doc! {
                "update": "u",
                "updates": [{
                    "q": { "_id": 1i32 },
                    "u": { "$inc": { "n": 1i32 }, "$set": { "n": 5i32 } },
                }],
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    let errors = reply.get_array("writeErrors").unwrap();
    let error = errors[0].as_document().unwrap();
    assert_eq!(error.get_i32("code").unwrap(), 40);

    let reply = server
        .command(&mut stream, doc! { "find": "u", "$db": "test" })
        .await;
    let docs = first_batch(&reply);
    assert_eq!(docs[0].get_i32("n").unwrap(), 1);
}

#[tokio::test]
async fn cursor_lifecycle_across_get_more() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let documents: Vec<Bson> = (0..5i32)
        .map(|i| Bson::Document(doc! { "_id": i, "n": i }))
        .collect();
    let reply = server
        .command(
            &mut stream,
            doc! { "insert": "five", "documents": documents, "$db": "test" },
        )
        .await;
    assert_eq!(reply.get_i32("n").unwrap(), 5);

    let reply = server
        .command(
            &mut stream,
            doc! {
                "find": "five",
                "sort": { "_id": 1i32 },
                "batchSize": 2i32,
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    let id = cursor_id(&reply);
    assert_ne!(id, 0);
    assert_eq!(first_batch(&reply).len(), 2);

    let reply = server
        .command(
            &mut stream,
            doc! { "getMore": id, "collection": "five", "batchSize": 2i32, "$db": "test" },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(next_batch(&reply).len(), 2);
    assert_eq!(cursor_id(&reply), id);

    let reply = server
        .command(
            &mut stream,
            doc! { "getMore": id, "collection": "five", "$db": "test" },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(next_batch(&reply).len(), 1);
    assert_eq!(cursor_id(&reply), 0);

    let reply = server
        .command(
            &mut stream,
            doc! { "getMore": id, "collection": "five", "$db": "test" },
        )
        .await;
    assert_eq!(error_code(&reply), 43);
    assert_eq!(reply.get_str("codeName").unwrap(), "CursorNotFound");
}

#[tokio::test]
async fn get_more_on_wrong_collection_is_not_found() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let documents: Vec<Bson> = (0..4i32)
        .map(|i| Bson::Document(doc! { "_id": i }))
        .collect();
    server
        .command(
            &mut stream,
            doc! { "insert": "k", "documents": documents, "$db": "test" },
        )
        .await;
    let reply = server
        .command(
            &mut stream,
            doc! { "find": "k", "batchSize": 1i32, "$db": "test" },
        )
        .await;
    let id = cursor_id(&reply);
    let reply = server
        .command(
            &mut stream,
            doc! { "getMore": id, "collection": "other", "$db": "test" },
        )
        .await;
    assert_eq!(error_code(&reply), 43);
}

#[tokio::test]
async fn find_with_filter_sort_and_projection() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let documents: Vec<Bson> = vec![
        Bson::Document(doc! { "_id": 1i32, "n": 3i32, "tag": "a" }),
        Bson::Document(doc! { "_id": 2i32, "n": 1i32, "tag": "b" }),
        Bson::Document(doc! { "_id": 3i32, "n": 2i32, "tag": "ab" }),
    ];
    server
        .command(
            &mut stream,
            doc! { "insert": "q", "documents": documents, "$db": "test" },
        )
        .await;

    let reply = server
        .command(
            &mut stream,
            doc! {
                "find": "q",
                "filter": { "n": { "$gte": 2i32 }, "tag": { "$regex": "^a" } },
                "sort": { "n": -1i32 },
                "projection": { "_id": 0i32, "n": 1i32 },
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    let docs = first_batch(&reply);
    assert_eq!(docs, vec![doc! { "n": 3i32 }, doc! { "n": 2i32 }]);
}

#[tokio::test]
async fn count_and_distinct() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let documents: Vec<Bson> = vec![
        Bson::Document(doc! { "_id": 1i32, "v": 1i32 }),
        Bson::Document(doc! { "_id": 2i32, "v": [2i32, 3i32] }),
        Bson::Document(doc! { "_id": 3i32, "v": 1.0f64 }),
    ];
    server
        .command(
            &mut stream,
            doc! { "insert": "d", "documents": documents, "$db": "test" },
        )
        .await;

    let reply = server
        .command(
            &mut stream,
            doc! { "count": "d", "query": { "v": { "$exists": true } }, "$db": "test" },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("n").unwrap(), 3);

    // 1 and 1.0 collapse to a single distinct value; the array unwinds.
    let reply = server
        .command(&mut stream, doc! { "distinct": "d", "key": "v", "$db": "test" })
        .await;
    assert_ok(&reply);
    let values = reply.get_array("values").unwrap();
    assert_eq!(values.len(), 3);

    let reply = server
        .command(
            &mut stream,
            doc! { "count": "missing", "$db": "test" },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("n").unwrap(), 0);
}

#[tokio::test]
async fn find_and_modify_update_and_remove() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    server
        .command(
            &mut stream,
            doc! {
                "insert": "fam",
                "documents": [{ "_id": 1i32, "n": 1i32 }],
                "$db": "test",
            },
        )
        .await;

    let reply = server
        .command(
            &mut stream,
            doc! {
                "findAndModify": "fam",
                "query": { "_id": 1i32 },
                "update": { "$inc": { "n": 4i32 } },
                "new": true,
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    let value = reply.get_document("value").unwrap();
    assert_eq!(value.get_i32("n").unwrap(), 5);
    let leo = reply.get_document("lastErrorObject").unwrap();
    assert!(leo.get_bool("updatedExisting").unwrap());

    let reply = server
        .command(
            &mut stream,
            doc! {
                "findAndModify": "fam",
                "query": { "_id": 1i32 },
                "remove": true,
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(
        reply
            .get_document("lastErrorObject")
            .unwrap()
            .get_i32("n")
            .unwrap(),
        1
    );

    let reply = server
        .command(&mut stream, doc! { "find": "fam", "$db": "test" })
        .await;
    assert!(first_batch(&reply).is_empty());
}

#[tokio::test]
async fn update_upsert_inserts_and_reports_id() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(
            &mut stream,
            doc! {
                "update": "ups",
                "updates": [{
                    "q": { "key": "k1" },
                    "u": { "$set": { "val": 7i32 } },
                    "upsert": true,
                }],
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("n").unwrap(), 1);
    assert_eq!(reply.get_i32("nModified").unwrap(), 0);
    let upserted = reply.get_array("upserted").unwrap();
    assert_eq!(upserted.len(), 1);

    let reply = server
        .command(
            &mut stream,
            doc! { "find": "ups", "filter": { "key": "k1" }, "$db": "test" },
        )
        .await;
    let docs = first_batch(&reply);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get_i32("val").unwrap(), 7);
}

#[tokio::test]
async fn ordered_insert_stops_at_first_error() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(
            &mut stream,
            doc! {
                "insert": "ord",
                "documents": [
                    { "_id": 1i32 },
                    { "_id": 1i32 },
                    { "_id": 2i32 },
                ],
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("n").unwrap(), 1);
    assert_eq!(reply.get_array("writeErrors").unwrap().len(), 1);

    // Unordered continues past the duplicate.
    let reply = server
        .command(
            &mut stream,
            doc! {
                "insert": "unord",
                "documents": [
                    { "_id": 1i32 },
                    { "_id": 1i32 },
                    { "_id": 2i32 },
                ],
                "ordered": false,
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("n").unwrap(), 2);
}

#[tokio::test]
async fn index_commands_round_trip() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(
            &mut stream,
            doc! {
                "createIndexes": "idx",
                "indexes": [{ "key": { "a": 1i32 }, "name": "a_1" }],
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("numIndexesBefore").unwrap(), 1);
    assert_eq!(reply.get_i32("numIndexesAfter").unwrap(), 2);

    let reply = server
        .command(&mut stream, doc! { "listIndexes": "idx", "$db": "test" })
        .await;
    assert_ok(&reply);
    let names: Vec<String> = first_batch(&reply)
        .iter()
        .map(|d| d.get_str("name").unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["_id_", "a_1"]);

    let reply = server
        .command(
            &mut stream,
            doc! { "dropIndexes": "idx", "index": "_id_", "$db": "test" },
        )
        .await;
    assert_eq!(error_code(&reply), 20);

    let reply = server
        .command(
            &mut stream,
            doc! { "dropIndexes": "idx", "index": "a_1", "$db": "test" },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("nIndexesWas").unwrap(), 2);

    let reply = server
        .command(
            &mut stream,
            doc! { "dropIndexes": "idx", "index": "a_1", "$db": "test" },
        )
        .await;
    assert_eq!(error_code(&reply), 27);
}

#[tokio::test]
async fn drop_commands() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(&mut stream, doc! { "drop": "nope", "$db": "test" })
        .await;
    assert_eq!(error_code(&reply), 26);

    let reply = server
        .command(&mut stream, doc! { "create": "real", "$db": "test" })
        .await;
    assert_ok(&reply);

    // Strict create of an existing collection fails.
    let reply = server
        .command(&mut stream, doc! { "create": "real", "$db": "test" })
        .await;
    assert_eq!(error_code(&reply), 48);

    let reply = server
        .command(&mut stream, doc! { "drop": "real", "$db": "test" })
        .await;
    assert_ok(&reply);

    let reply = server
        .command(&mut stream, doc! { "dropDatabase": 1i32, "$db": "test" })
        .await;
    assert_ok(&reply);

    // Dropping a database twice is still ok.
    let reply = server
        .command(&mut stream, doc! { "dropDatabase": 1i32, "$db": "test" })
        .await;
    assert_ok(&reply);
}

#[tokio::test]
async fn aggregate_match_sort_project_count() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let documents: Vec<Bson> = (1..=4i32)
        .map(|i| Bson::Document(doc! { "_id": i, "n": i }))
        .collect();
    server
        .command(
            &mut stream,
            doc! { "insert": "agg", "documents": documents, "$db": "test" },
        )
        .await;

    let reply = server
        .command(
            &mut stream,
            doc! {
                "aggregate": "agg",
                "pipeline": [
                    { "$match": { "n": { "$gte": 2i32 } } },
                    { "$sort": { "n": -1i32 } },
                    { "$project": { "_id": 0i32, "n": 1i32 } },
                    { "$limit": 2i64 },
                ],
                "cursor": {},
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    let docs = first_batch(&reply);
    assert_eq!(docs, vec![doc! { "n": 4i32 }, doc! { "n": 3i32 }]);

    let reply = server
        .command(
            &mut stream,
            doc! {
                "aggregate": "agg",
                "pipeline": [{ "$count": "total" }],
                "cursor": {},
                "$db": "test",
            },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(first_batch(&reply)[0].get_i32("total").unwrap(), 4);

    let reply = server
        .command(
            &mut stream,
            doc! {
                "aggregate": "agg",
                "pipeline": [{ "$facet": {} }],
                "cursor": {},
                "$db": "test",
            },
        )
        .await;
    assert_eq!(error_code(&reply), 2);
}

#[tokio::test]
async fn kill_cursors_reports_both_lists() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let documents: Vec<Bson> = (0..4i32)
        .map(|i| Bson::Document(doc! { "_id": i }))
        .collect();
    server
        .command(
            &mut stream,
            doc! { "insert": "kc", "documents": documents, "$db": "test" },
        )
        .await;
    let reply = server
        .command(
            &mut stream,
            doc! { "find": "kc", "batchSize": 1i32, "$db": "test" },
        )
        .await;
    let id = cursor_id(&reply);

    let reply = server
        .command(
            &mut stream,
            doc! { "killCursors": "kc", "cursors": [id, 424242i64], "$db": "test" },
        )
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_array("cursorsKilled").unwrap(), &vec![Bson::Int64(id)]);
    assert_eq!(
        reply.get_array("cursorsNotFound").unwrap(),
        &vec![Bson::Int64(424242)]
    );

    let reply = server
        .command(
            &mut stream,
            doc! { "getMore": id, "collection": "kc", "$db": "test" },
        )
        .await;
    assert_eq!(error_code(&reply), 43);
}

#[tokio::test]
async fn oversized_message_is_rejected_and_closes_connection() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let mut msg = Vec::new();
    MessageHeader {
        message_length: 64 * 1024 * 1024,
        request_id: 1,
        response_to: 0,
        op_code: OP_MSG,
    }
    .write_to(&mut msg);
    stream.write_all(&msg).await.unwrap();

    let reply = read_reply(&mut stream).await;
    assert_eq!(error_code(&reply), 10334);
    assert_eq!(reply.get_str("codeName").unwrap(), "BSONObjectTooLarge");

    // The server hangs up afterwards.
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0);

    drop(server);
}

#[tokio::test]
async fn default_batch_size_is_101() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let documents: Vec<Bson> = (0..150i32)
        .map(|i| Bson::Document(doc! { "_id": i }))
        .collect();
    let reply = server
        .command(
            &mut stream,
            doc! { "insert": "many", "documents": documents, "$db": "test" },
        )
        .await;
    assert_eq!(reply.get_i32("n").unwrap(), 150);

    let reply = server
        .command(&mut stream, doc! { "find": "many", "$db": "test" })
        .await;
    assert_eq!(first_batch(&reply).len(), 101);
    let id = cursor_id(&reply);
    assert_ne!(id, 0);

    let reply = server
        .command(
            &mut stream,
            doc! { "getMore": id, "collection": "many", "$db": "test" },
        )
        .await;
    assert_eq!(next_batch(&reply).len(), 49);
    assert_eq!(cursor_id(&reply), 0);
}

#[tokio::test]
async fn max_time_ms_zero_is_accepted() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(
            &mut stream,
            doc! { "ping": 1i32, "maxTimeMS": 0i32, "$db": "admin" },
        )
        .await;
    assert_ok(&reply);

    let reply = server
        .command(
            &mut stream,
            doc! { "ping": 1i32, "maxTimeMS": "soon", "$db": "admin" },
        )
        .await;
    assert_eq!(error_code(&reply), 2);
}

#[tokio::test]
async fn server_diagnostics_respond() {
    let mut server = TestServer::start().await;
    let mut stream = server.connect().await;

    let reply = server
        .command(&mut stream, doc! { "buildInfo": 1i32, "$db": "admin" })
        .await;
    assert_ok(&reply);
    assert!(reply.get_str("version").is_ok());

    let reply = server
        .command(&mut stream, doc! { "whatsmyuri": 1i32, "$db": "admin" })
        .await;
    assert_ok(&reply);
    assert!(reply.get_str("you").unwrap().contains("127.0.0.1"));

    let reply = server
        .command(&mut stream, doc! { "serverStatus": 1i32, "$db": "admin" })
        .await;
    assert_ok(&reply);
    assert!(reply.get_document("connections").is_ok());

    let reply = server
        .command(
            &mut stream,
            doc! { "getCmdLineOpts": 1i32, "$db": "admin" },
        )
        .await;
    assert_ok(&reply);

    let reply = server
        .command(
            &mut stream,
            doc! { "getLog": "startupWarnings", "$db": "admin" },
        )
        .await;
    assert_ok(&reply);

    let reply = server
        .command(
            &mut stream,
            doc! { "connectionStatus": 1i32, "$db": "admin" },
        )
        .await;
    assert_ok(&reply);

    let reply = server
        .command(&mut stream, doc! { "dbStats": 1i32, "$db": "nosuch" })
        .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i64("objects").unwrap_or(0), 0);
}
