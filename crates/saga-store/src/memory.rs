use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{CorrelationId, RepositoryError, Result, SagaRecord, Version, store::SagaRepository};

type Key = (String, CorrelationId);

/// In-memory saga repository.
///
/// Every write takes the map's write lock, so the version check and the
/// write form a single compare-and-set. Provides the same contract as the
/// PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaRepository {
    sagas: Arc<RwLock<HashMap<Key, SagaRecord>>>,
}

impl InMemorySagaRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored instances across all saga types.
    pub async fn instance_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Clears all instances.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaRecord>> {
        let sagas = self.sagas.read().await;
        Ok(sagas.get(&(saga_type.to_string(), correlation_id)).cloned())
    }

    async fn insert(&self, mut record: SagaRecord) -> Result<Version> {
        let mut sagas = self.sagas.write().await;
        let key = (record.saga_type.clone(), record.correlation_id);

        if sagas.contains_key(&key) {
            return Err(RepositoryError::DuplicateKey {
                correlation_id: record.correlation_id,
                key: record.correlation_id.to_string(),
            });
        }

        if let Some(ref unique_key) = record.unique_key
            && sagas.values().any(|existing| {
                existing.saga_type == record.saga_type
                    && existing.unique_key.as_ref() == Some(unique_key)
            })
        {
            return Err(RepositoryError::DuplicateKey {
                correlation_id: record.correlation_id,
                key: unique_key.clone(),
            });
        }

        let now = Utc::now();
        record.version = Version::first();
        record.created_at = now;
        record.updated_at = now;
        sagas.insert(key, record);

        Ok(Version::first())
    }

    async fn save(&self, mut record: SagaRecord, expected: Version) -> Result<Version> {
        let mut sagas = self.sagas.write().await;
        let key = (record.saga_type.clone(), record.correlation_id);

        let current = sagas
            .get(&key)
            .ok_or(RepositoryError::NotFound(record.correlation_id))?;

        if current.version != expected {
            return Err(RepositoryError::ConcurrencyConflict {
                correlation_id: record.correlation_id,
                expected,
                actual: current.version,
            });
        }

        if let Some(ref unique_key) = record.unique_key
            && sagas.iter().any(|(other, existing)| {
                *other != key
                    && existing.saga_type == record.saga_type
                    && existing.unique_key.as_ref() == Some(unique_key)
            })
        {
            return Err(RepositoryError::DuplicateKey {
                correlation_id: record.correlation_id,
                key: unique_key.clone(),
            });
        }

        let new_version = expected.next();
        record.version = new_version;
        record.created_at = current.created_at;
        record.updated_at = Utc::now();
        sagas.insert(key, record);

        Ok(new_version)
    }

    async fn delete(
        &self,
        saga_type: &str,
        correlation_id: CorrelationId,
        expected: Version,
    ) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        let key = (saga_type.to_string(), correlation_id);

        match sagas.get(&key) {
            None => Ok(()),
            Some(current) if current.version != expected => {
                Err(RepositoryError::ConcurrencyConflict {
                    correlation_id,
                    expected,
                    actual: current.version,
                })
            }
            Some(_) => {
                sagas.remove(&key);
                Ok(())
            }
        }
    }

    async fn list(&self, saga_type: &str) -> Result<Vec<SagaRecord>> {
        let sagas = self.sagas.read().await;
        let mut records: Vec<_> = sagas
            .values()
            .filter(|r| r.saga_type == saga_type)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.correlation_id.cmp(&b.correlation_id))
        });
        Ok(records)
    }
}
