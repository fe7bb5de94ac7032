/*!
 * @file server.rs
 * @brief TCP listener and per-connection request loop
 */

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::commands::{merge_sequences, CommandContext, CommandTable, ServerState, SharedBackend};
use crate::config::Config;
use crate::error::{CommandError, ErrorCode, FerroDBError, Result};
use crate::session::Session;
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownHandle};
use crate::wire_protocol::{
    self, MessageHeader, HEADER_LEN, MAX_MESSAGE_LEN, OP_MSG, OP_QUERY,
};

pub struct Server {
    state: Arc<ServerState>,
    backend: SharedBackend,
    table: Arc<CommandTable>,
}

impl Server {
    pub fn new(config: Config, backend: SharedBackend) -> Self {
        Self {
            state: Arc::new(ServerState::new(config)),
            backend,
            table: Arc::new(CommandTable::new()),
        }
    }

    /// Run until the shutdown handle fires. Binds, then serves.
    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        let addr = self.state.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "server listening");
        self.serve(listener, &mut shutdown).await
    }

    /// Bind to the configured address (port 0 picks a free one), then serve
    /// in a background task. Returns the bound address, a shutdown handle
    /// and the join handle; the shape integration tests drive.
    pub async fn spawn_with_shutdown(
        config: Config,
        backend: SharedBackend,
    ) -> Result<(SocketAddr, ShutdownHandle, JoinHandle<()>)> {
        let server = Server::new(config, backend);
        let addr = server.state.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let (handle, mut shutdown) = shutdown_channel();
        let task = tokio::spawn(async move {
            if let Err(e) = server.serve(listener, &mut shutdown).await {
                error!(error = %e, "server terminated abnormally");
            }
        });
        Ok((local_addr, handle, task))
    }

    async fn serve(&self, listener: TcpListener, shutdown: &mut Shutdown) -> Result<()> {
        let connection_ids = AtomicU64::new(0);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let connection_id = connection_ids.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(%peer, connection_id, "accepted connection");
                    let state = Arc::clone(&self.state);
                    let backend = Arc::clone(&self.backend);
                    let table = Arc::clone(&self.table);
                    tokio::spawn(async move {
                        state.current_connections.fetch_add(1, Ordering::Relaxed);
                        handle_connection(stream, peer, connection_id, &state, backend, table)
                            .await;
                        state.current_connections.fetch_sub(1, Ordering::Relaxed);
                        debug!(%peer, connection_id, "connection closed");
                    });
                }
                _ = shutdown.triggered() => {
                    info!("stopping accept loop");
                    return Ok(());
                }
            }
        }
    }
}

/// Serial request loop for one connection. Command errors reply and keep the
/// connection; protocol errors close it. Cursors die with the session.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    connection_id: u64,
    state: &ServerState,
    backend: SharedBackend,
    table: Arc<CommandTable>,
) {
    let _ = stream.set_nodelay(true);
    let ttl = Duration::from_secs(state.config.cursors.ttl_seconds);
    let mut session = Session::new(connection_id, peer.to_string(), ttl);

    loop {
        let mut header_buf = [0u8; HEADER_LEN];
        match stream.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
            Err(e) => {
                debug!(%peer, error = %e, "read failed");
                return;
            }
        }
        let header = MessageHeader::parse(&header_buf);
        if header.message_length < HEADER_LEN as i32 {
            warn!(%peer, length = header.message_length, "invalid message length");
            return;
        }
        if header.message_length > MAX_MESSAGE_LEN {
            // Reject with the canonical error, then terminate.
            let error = CommandError::new(
                ErrorCode::BsonObjectTooLarge,
                format!(
                    "message length {} exceeds the maximum of {MAX_MESSAGE_LEN} bytes",
                    header.message_length
                ),
            );
            let _ = write_op_msg_reply(&mut stream, &mut session, &header, &error.to_document())
                .await;
            return;
        }

        let mut body = vec![0u8; header.message_length as usize - HEADER_LEN];
        if let Err(e) = stream.read_exact(&mut body).await {
            debug!(%peer, error = %e, "body read failed");
            return;
        }

        match header.op_code {
            OP_MSG => {
                let message = match wire_protocol::decode_op_msg(&body) {
                    Ok(message) => message,
                    Err(e) => {
                        // Un-frameable payload; answer once, then close.
                        let error =
                            CommandError::new(ErrorCode::InvalidBson, e.to_string());
                        let _ = write_op_msg_reply(
                            &mut stream,
                            &mut session,
                            &header,
                            &error.to_document(),
                        )
                        .await;
                        return;
                    }
                };
                let request = merge_sequences(message.document, message.sequences);
                let mut cx = CommandContext {
                    backend: backend.as_ref(),
                    session: &mut session,
                    server: state,
                };
                let reply = table.execute(&mut cx, &request).await;
                if write_op_msg_reply(&mut stream, &mut session, &header, &reply)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            OP_QUERY => {
                let reply = match wire_protocol::decode_op_query(&body) {
                    Ok(query) => {
                        // Legacy handshake: `<db>.$cmd` carries the command.
                        match query.full_collection_name.strip_suffix(".$cmd") {
                            Some(db) => {
                                let mut request = query.query.clone();
                                if !request.contains_key("$db") {
                                    request.insert("$db", db.to_string());
                                }
                                let mut cx = CommandContext {
                                    backend: backend.as_ref(),
                                    session: &mut session,
                                    server: state,
                                };
                                table.execute(&mut cx, &request).await
                            }
                            None => CommandError::new(
                                ErrorCode::IllegalOperation,
                                "OP_QUERY is supported only for commands",
                            )
                            .to_document(),
                        }
                    }
                    Err(e) => {
                        CommandError::new(ErrorCode::InvalidBson, e.to_string()).to_document()
                    }
                };
                let request_id = session.next_request_id();
                let encoded = match wire_protocol::encode_op_reply(
                    &[reply],
                    request_id,
                    header.request_id,
                ) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(%peer, error = %e, "failed to encode reply");
                        return;
                    }
                };
                if stream.write_all(&encoded).await.is_err() {
                    return;
                }
            }
            other => {
                warn!(%peer, opcode = other, "unsupported opcode");
                return;
            }
        }
    }
}

async fn write_op_msg_reply(
    stream: &mut TcpStream,
    session: &mut Session,
    header: &MessageHeader,
    reply: &bson::Document,
) -> Result<()> {
    let request_id = session.next_request_id();
    let encoded = wire_protocol::encode_op_msg(reply, request_id, header.request_id)?;
    stream
        .write_all(&encoded)
        .await
        .map_err(FerroDBError::Network)?;
    Ok(())
}

// Startup probe used by the binary before accepting connections.
pub async fn verify_backend(backend: &dyn crate::backend::Backend) -> Result<()> {
    backend
        .ping()
        .await
        .map_err(|e| FerroDBError::Database(format!("backend ping failed: {e}")))
}
