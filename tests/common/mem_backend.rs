//! In-memory implementation of the storage backend, used to drive the full
//! wire path in tests without a PostgreSQL instance.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bson::{Bson, Document};
use ferrodb::backend::{
    validate_collection_name, validate_database_name, Backend, BackendError, BackendResult,
    CollectionStats, DatabaseStats, IndexSpec, NamespaceKind, QueryParams, QueryResult,
};
use ferrodb::value::values_equal;

#[derive(Default)]
struct CollectionData {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

#[derive(Default)]
pub struct MemBackend {
    databases: Mutex<BTreeMap<String, BTreeMap<String, CollectionData>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn list_databases(&self) -> BackendResult<Vec<String>> {
        Ok(self.databases.lock().unwrap().keys().cloned().collect())
    }

    async fn create_database(&self, db: &str) -> BackendResult<()> {
        validate_database_name(db)?;
        let mut databases = self.databases.lock().unwrap();
        if databases.contains_key(db) {
            return Err(BackendError::AlreadyExists(NamespaceKind::Database));
        }
        databases.insert(db.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn create_database_if_not_exists(&self, db: &str) -> BackendResult<()> {
        validate_database_name(db)?;
        self.databases
            .lock()
            .unwrap()
            .entry(db.to_string())
            .or_default();
        Ok(())
    }

    async fn drop_database(&self, db: &str) -> BackendResult<()> {
        validate_database_name(db)?;
        match self.databases.lock().unwrap().remove(db) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(NamespaceKind::Database)),
        }
    }

    async fn list_collections(&self, db: &str) -> BackendResult<Vec<String>> {
        let databases = self.databases.lock().unwrap();
        let database = databases
            .get(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?;
        Ok(database.keys().cloned().collect())
    }

    async fn create_collection(&self, db: &str, collection: &str) -> BackendResult<()> {
        validate_collection_name(collection)?;
        let mut databases = self.databases.lock().unwrap();
        let database = databases
            .get_mut(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?;
        if database.contains_key(collection) {
            return Err(BackendError::AlreadyExists(NamespaceKind::Collection));
        }
        database.insert(collection.to_string(), CollectionData::default());
        Ok(())
    }

    async fn create_collection_if_not_exists(
        &self,
        db: &str,
        collection: &str,
    ) -> BackendResult<()> {
        validate_database_name(db)?;
        validate_collection_name(collection)?;
        let mut databases = self.databases.lock().unwrap();
        databases
            .entry(db.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn drop_collection(&self, db: &str, collection: &str) -> BackendResult<()> {
        let mut databases = self.databases.lock().unwrap();
        let database = databases
            .get_mut(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?;
        match database.remove(collection) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(NamespaceKind::Collection)),
        }
    }

    async fn insert_document(
        &self,
        db: &str,
        collection: &str,
        document: &Document,
    ) -> BackendResult<()> {
        let mut databases = self.databases.lock().unwrap();
        let data = databases
            .get_mut(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?
            .get_mut(collection)
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))?;
        if let Some(id) = document.get("_id") {
            let duplicate = data.documents.iter().any(|existing| {
                existing
                    .get("_id")
                    .map(|other| values_equal(other, id))
                    .unwrap_or(false)
            });
            if duplicate {
                return Err(BackendError::DuplicateKey);
            }
        }
        data.documents.push(document.clone());
        Ok(())
    }

    async fn query_documents(
        &self,
        db: &str,
        collection: &str,
        params: &QueryParams,
    ) -> BackendResult<QueryResult> {
        let databases = self.databases.lock().unwrap();
        let data = databases
            .get(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?
            .get(collection)
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))?;
        // Full scan; an empty filter is the only complete pushdown here.
        let complete = params.filter.is_empty();
        let mut documents = data.documents.clone();
        if complete {
            if let Some(limit) = params.limit {
                documents.truncate(limit as usize);
            }
        }
        Ok(QueryResult {
            documents,
            pushdown_complete: complete,
        })
    }

    async fn update_document(
        &self,
        db: &str,
        collection: &str,
        id: &Bson,
        document: &Document,
    ) -> BackendResult<()> {
        let mut databases = self.databases.lock().unwrap();
        let data = databases
            .get_mut(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?
            .get_mut(collection)
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))?;
        for existing in data.documents.iter_mut() {
            let matches = existing
                .get("_id")
                .map(|other| values_equal(other, id))
                .unwrap_or(false);
            if matches {
                *existing = document.clone();
                return Ok(());
            }
        }
        Err(BackendError::NotFound(NamespaceKind::Document))
    }

    async fn delete_document(&self, db: &str, collection: &str, id: &Bson) -> BackendResult<()> {
        let mut databases = self.databases.lock().unwrap();
        let data = databases
            .get_mut(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?
            .get_mut(collection)
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))?;
        let before = data.documents.len();
        data.documents.retain(|existing| {
            !existing
                .get("_id")
                .map(|other| values_equal(other, id))
                .unwrap_or(false)
        });
        if data.documents.len() == before {
            return Err(BackendError::NotFound(NamespaceKind::Document));
        }
        Ok(())
    }

    async fn create_index(
        &self,
        db: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> BackendResult<bool> {
        let mut databases = self.databases.lock().unwrap();
        let data = databases
            .get_mut(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?
            .get_mut(collection)
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))?;
        if index.name == "_id_" || data.indexes.iter().any(|e| e == index) {
            return Ok(false);
        }
        if data.indexes.iter().any(|e| e.name == index.name) {
            return Err(BackendError::AlreadyExists(NamespaceKind::Index));
        }
        data.indexes.push(index.clone());
        Ok(true)
    }

    async fn drop_index(&self, db: &str, collection: &str, name: &str) -> BackendResult<()> {
        let mut databases = self.databases.lock().unwrap();
        let data = databases
            .get_mut(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?
            .get_mut(collection)
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))?;
        match data.indexes.iter().position(|e| e.name == name) {
            Some(position) => {
                data.indexes.remove(position);
                Ok(())
            }
            None => Err(BackendError::NotFound(NamespaceKind::Index)),
        }
    }

    async fn list_indexes(&self, db: &str, collection: &str) -> BackendResult<Vec<IndexSpec>> {
        let databases = self.databases.lock().unwrap();
        let data = databases
            .get(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?
            .get(collection)
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))?;
        let mut indexes = vec![IndexSpec::id_index()];
        indexes.extend(data.indexes.iter().cloned());
        Ok(indexes)
    }

    async fn collection_stats(
        &self,
        db: &str,
        collection: &str,
    ) -> BackendResult<CollectionStats> {
        let databases = self.databases.lock().unwrap();
        let data = databases
            .get(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?
            .get(collection)
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))?;
        let size: usize = data
            .documents
            .iter()
            .map(|d| bson::to_vec(d).map(|b| b.len()).unwrap_or(0))
            .sum();
        Ok(CollectionStats {
            count: data.documents.len() as i64,
            size_bytes: size as i64,
        })
    }

    async fn database_stats(&self, db: &str) -> BackendResult<DatabaseStats> {
        let databases = self.databases.lock().unwrap();
        let database = databases
            .get(db)
            .ok_or(BackendError::NotFound(NamespaceKind::Database))?;
        let mut stats = DatabaseStats {
            collections: database.len() as i64,
            ..Default::default()
        };
        for data in database.values() {
            stats.objects += data.documents.len() as i64;
            stats.size_bytes += data
                .documents
                .iter()
                .map(|d| bson::to_vec(d).map(|b| b.len() as i64).unwrap_or(0))
                .sum::<i64>();
        }
        Ok(stats)
    }

    async fn ping(&self) -> BackendResult<()> {
        Ok(())
    }
}
