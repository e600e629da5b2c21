use crate::domain::payment::PaymentState;
use crate::domain::ports::StateRepository;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use std::path::Path;
use std::sync::Arc;

/// Column Family for storing payment states.
pub const CF_PAYMENT_STATES: &str = "payment_states";

/// A persistent state repository backed by RocksDB.
///
/// States are stored as JSON under their order id in a dedicated column family.
/// `Clone` shares the underlying `Arc<DB>`.
#[derive(Clone)]
pub struct RocksDBStateRepository {
    db: Arc<DB>,
}

impl RocksDBStateRepository {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_states = ColumnFamilyDescriptor::new(CF_PAYMENT_STATES, Options::default());
        let db = DB::open_cf_descriptors(&opts, path, vec![cf_states])?;

        Ok(Self { db: Arc::new(db) })
    }

    fn column_family(&self) -> Result<&ColumnFamily> {
        self.db.cf_handle(CF_PAYMENT_STATES).ok_or_else(|| {
            PaymentError::Internal(Box::new(std::io::Error::other(
                "Payment states column family not found",
            )))
        })
    }
}

#[async_trait]
impl StateRepository for RocksDBStateRepository {
    async fn store(&self, state: PaymentState) -> Result<()> {
        let cf = self.column_family()?;
        let value = serde_json::to_vec(&state)?;
        self.db.put_cf(cf, state.order_id.as_bytes(), value)?;
        Ok(())
    }

    async fn get(&self, order_id: &str) -> Result<Option<PaymentState>> {
        let cf = self.column_family()?;
        match self.db.get_cf(cf, order_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> Result<Vec<PaymentState>> {
        let cf = self.column_family()?;
        let mut states = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            states.push(serde_json::from_slice(&value)?);
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::{PaymentMethod, PaymentStatus};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let repo = RocksDBStateRepository::open(dir.path()).expect("Failed to open RocksDB");
        assert!(repo.db.cf_handle(CF_PAYMENT_STATES).is_some());
    }

    #[tokio::test]
    async fn test_rocksdb_state_repository() {
        let dir = tempdir().unwrap();
        let repo = RocksDBStateRepository::open(dir.path()).unwrap();

        let mut state = PaymentState::new("order-1", PaymentMethod::Pse, Utc::now());
        state.status = PaymentStatus::Approved;
        state.transaction_id = Some("tx-1".to_string());

        repo.store(state.clone()).await.unwrap();

        let retrieved = repo.get("order-1").await.unwrap().unwrap();
        assert_eq!(retrieved, state);

        let all = repo.get_all().await.unwrap();
        assert_eq!(all.len(), 1);

        assert!(repo.get("order-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rocksdb_survives_reopen() {
        let dir = tempdir().unwrap();
        let state = PaymentState::new("order-9", PaymentMethod::Cash, Utc::now());
        {
            let repo = RocksDBStateRepository::open(dir.path()).unwrap();
            repo.store(state.clone()).await.unwrap();
        }
        let repo = RocksDBStateRepository::open(dir.path()).unwrap();
        assert_eq!(repo.get("order-9").await.unwrap(), Some(state));
    }
}
