/*!
 * @file session.rs
 * @brief Per-connection state: cursors, last error, reply ids
 */

use std::time::Duration;

use crate::cursor::CursorRegistry;
use crate::error::CommandError;

/// State owned by a single client connection. Requests on a connection are
/// handled strictly serially, so no interior locking is needed.
#[derive(Debug)]
pub struct Session {
    pub connection_id: u64,
    pub peer_addr: String,
    pub cursors: CursorRegistry,
    pub last_error: Option<CommandError>,
    next_request_id: i32,
}

impl Session {
    pub fn new(connection_id: u64, peer_addr: String, cursor_ttl: Duration) -> Self {
        Self {
            connection_id,
            peer_addr,
            cursors: CursorRegistry::new(cursor_ttl),
            last_error: None,
            next_request_id: 0,
        }
    }

    /// Monotonically increasing requestID for outgoing replies.
    pub fn next_request_id(&mut self) -> i32 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.next_request_id
    }

    pub fn record_error(&mut self, error: &CommandError) {
        self.last_error = Some(error.clone());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }
}
