use crate::domain::payment::PaymentState;
use crate::domain::ports::StateRepository;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory repository for payment states.
///
/// Uses `Arc<RwLock<HashMap<String, PaymentState>>>` so clones share the same map.
/// Suitable for tests and for processes that do not need to survive a restart.
#[derive(Default, Clone)]
pub struct InMemoryStateRepository {
    states: Arc<RwLock<HashMap<String, PaymentState>>>,
}

impl InMemoryStateRepository {
    /// Creates a new, empty in-memory repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateRepository for InMemoryStateRepository {
    async fn store(&self, state: PaymentState) -> Result<()> {
        let mut states = self.states.write().await;
        states.insert(state.order_id.clone(), state);
        Ok(())
    }

    async fn get(&self, order_id: &str) -> Result<Option<PaymentState>> {
        let states = self.states.read().await;
        Ok(states.get(order_id).cloned())
    }

    async fn get_all(&self) -> Result<Vec<PaymentState>> {
        let states = self.states.read().await;
        Ok(states.values().cloned().collect())
    }
}
