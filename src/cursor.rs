/*!
 * @file cursor.rs
 * @brief Per-connection cursor arena with lazy TTL collection
 */

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bson::Document;
use rand::Rng;

use crate::error::{CommandError, CommandResult, ErrorCode};

#[derive(Debug)]
pub struct Cursor {
    pub id: i64,
    pub database: String,
    pub collection: String,
    remaining: VecDeque<Document>,
    last_used: Instant,
}

impl Cursor {
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    pub fn take_batch(&mut self, batch_size: usize) -> Vec<Document> {
        let n = batch_size.min(self.remaining.len());
        self.remaining.drain(..n).collect()
    }

    pub fn is_drained(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Cursor arena owned by a single connection. Ids are non-zero, random, and
/// never reused for the lifetime of the connection.
#[derive(Debug)]
pub struct CursorRegistry {
    cursors: HashMap<i64, Cursor>,
    issued_ids: HashSet<i64>,
    ttl: Duration,
}

impl CursorRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cursors: HashMap::new(),
            issued_ids: HashSet::new(),
            ttl,
        }
    }

    fn fresh_id(&mut self) -> i64 {
        let mut rng = rand::thread_rng();
        loop {
            let id: i64 = rng.gen();
            if id != 0 && self.issued_ids.insert(id) {
                return id;
            }
        }
    }

    /// Register the undrained remainder of a result set and return the new
    /// cursor id.
    pub fn create(&mut self, database: &str, collection: &str, remaining: Vec<Document>) -> i64 {
        let id = self.fresh_id();
        self.cursors.insert(
            id,
            Cursor {
                id,
                database: database.to_string(),
                collection: collection.to_string(),
                remaining: remaining.into(),
                last_used: Instant::now(),
            },
        );
        id
    }

    /// Fetch the next batch. Expired cursors are collected here, lazily; a
    /// drained cursor is destroyed and reported with id 0.
    pub fn get_more(
        &mut self,
        id: i64,
        collection: &str,
        batch_size: usize,
    ) -> CommandResult<(Vec<Document>, i64, String)> {
        let not_found =
            || CommandError::new(ErrorCode::CursorNotFound, format!("cursor id {id} not found"));
        let cursor = self.cursors.get_mut(&id).ok_or_else(not_found)?;
        if cursor.last_used.elapsed() > self.ttl {
            self.cursors.remove(&id);
            return Err(not_found());
        }
        if cursor.collection != collection {
            return Err(not_found());
        }
        cursor.last_used = Instant::now();
        let batch = cursor.take_batch(batch_size);
        let namespace = cursor.namespace();
        let next_id = if cursor.is_drained() {
            self.cursors.remove(&id);
            0
        } else {
            id
        };
        Ok((batch, next_id, namespace))
    }

    pub fn kill(&mut self, id: i64) -> bool {
        self.cursors.remove(&id).is_some()
    }

    pub fn open_count(&self) -> usize {
        self.cursors.len()
    }
}
