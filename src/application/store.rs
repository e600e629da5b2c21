use crate::domain::payment::{PaymentEvent, PaymentMethod, PaymentState, PaymentStatus, StatePatch};
use crate::domain::ports::StateRepositoryBox;
use crate::error::{PaymentError, Result};
use crate::infrastructure::in_memory::InMemoryStateRepository;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Callback invoked for every event published on an order.
pub type Listener = Arc<dyn Fn(&PaymentEvent) + Send + Sync>;

type SubscriberMap = DashMap<String, Vec<(u64, Listener)>>;

/// Single source of truth for every order's [`PaymentState`].
///
/// All mutation goes through [`update_state`](Self::update_state) and
/// [`reset_state`](Self::reset_state). Each mutation is persisted through the
/// repository and then published to the order's subscribers before the call
/// returns, while the write lock is still held, so subscribers observe
/// updates in the order they were applied.
pub struct PaymentStateStore {
    states: RwLock<HashMap<String, PaymentState>>,
    repository: StateRepositoryBox,
    subscribers: Arc<SubscriberMap>,
    next_subscriber: AtomicU64,
}

impl Default for PaymentStateStore {
    fn default() -> Self {
        Self::new(Box::new(InMemoryStateRepository::new()))
    }
}

impl PaymentStateStore {
    pub fn new(repository: StateRepositoryBox) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            repository,
            subscribers: Arc::new(DashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Loads previously persisted states. States already in memory win.
    pub async fn hydrate(&self) -> Result<usize> {
        let persisted = self.repository.get_all().await?;
        let mut states = self.states.write().await;
        let mut loaded = 0;
        for state in persisted {
            if !states.contains_key(&state.order_id) {
                states.insert(state.order_id.clone(), state);
                loaded += 1;
            }
        }
        tracing::debug!(loaded, "Hydrated payment states");
        Ok(loaded)
    }

    pub async fn get_state(&self, order_id: &str) -> Option<PaymentState> {
        self.states.read().await.get(order_id).cloned()
    }

    /// Snapshot of every known state.
    pub async fn states(&self) -> Vec<PaymentState> {
        self.states.read().await.values().cloned().collect()
    }

    /// Returns the order's state, creating a PENDING one if none exists.
    ///
    /// `method` is ignored when the state already exists.
    pub async fn create_state(&self, order_id: &str, method: PaymentMethod) -> Result<PaymentState> {
        let mut states = self.states.write().await;
        if let Some(existing) = states.get(order_id) {
            return Ok(existing.clone());
        }

        let state = PaymentState::new(order_id, method, Utc::now());
        self.repository.store(state.clone()).await?;
        states.insert(order_id.to_string(), state.clone());
        tracing::info!(order_id, %method, "Created payment state");
        Ok(state)
    }

    /// Merges `patch` into the order's state and notifies its subscribers.
    pub async fn update_state(&self, order_id: &str, patch: StatePatch) -> Result<PaymentState> {
        let mut states = self.states.write().await;
        let current = states
            .get_mut(order_id)
            .ok_or_else(|| PaymentError::NotFound(order_id.to_string()))?;

        let previous = current.status;
        let mut next = current.clone();
        next.apply(patch, Utc::now())?;
        self.repository.store(next.clone()).await?;
        *current = next.clone();

        if previous != next.status {
            tracing::info!(
                order_id,
                from = %previous,
                to = %next.status,
                transaction_id = next.transaction_id.as_deref().unwrap_or(""),
                "Payment status changed"
            );
        }
        self.publish(order_id, &PaymentEvent::StateChanged { state: next.clone() });
        Ok(next)
    }

    /// Starts a new attempt for an order.
    ///
    /// Allowed when the previous attempt errored, or when it is still PENDING
    /// without a gateway transaction. The fresh state is PENDING with no
    /// transaction id. Orders without a state get one created; anything else
    /// is rejected.
    pub async fn reset_state(&self, order_id: &str, method: PaymentMethod) -> Result<PaymentState> {
        let mut states = self.states.write().await;
        let next = match states.get(order_id) {
            None => PaymentState::new(order_id, method, Utc::now()),
            Some(current) if is_restartable(current) => current.restarted(method, Utc::now()),
            Some(current) => {
                return Err(PaymentError::InvalidTransition {
                    from: current.status,
                    to: PaymentStatus::Pending,
                });
            }
        };

        self.repository.store(next.clone()).await?;
        states.insert(order_id.to_string(), next.clone());
        tracing::info!(order_id, attempt = next.attempt, %method, "Restarted payment attempt");
        self.publish(order_id, &PaymentEvent::AttemptRestarted { state: next.clone() });
        Ok(next)
    }

    /// Registers `listener` for events on `order_id`.
    pub fn subscribe<F>(&self, order_id: &str, listener: F) -> Subscription
    where
        F: Fn(&PaymentEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(order_id.to_string())
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            order_id: order_id.to_string(),
            id,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self, order_id: &str) -> usize {
        self.subscribers
            .get(order_id)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }

    fn publish(&self, order_id: &str, event: &PaymentEvent) {
        // Listeners run outside the map guard so they may (un)subscribe.
        let listeners: Vec<Listener> = match self.subscribers.get(order_id) {
            Some(entry) => entry.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(event);
        }
    }
}

fn is_restartable(state: &PaymentState) -> bool {
    match state.status {
        PaymentStatus::Error => true,
        PaymentStatus::Pending => state.transaction_id.is_none(),
        _ => false,
    }
}

/// Handle returned by [`PaymentStateStore::subscribe`].
#[must_use = "dropping a Subscription keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
    order_id: String,
    id: u64,
    subscribers: Arc<SubscriberMap>,
}

impl Subscription {
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    /// Deregisters the listener.
    pub fn unsubscribe(self) {
        if let Some(mut entry) = self.subscribers.get_mut(&self.order_id) {
            entry.retain(|(id, _)| *id != self.id);
        }
        self.subscribers
            .remove_if(&self.order_id, |_, listeners| listeners.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::TransactionIdSource;
    use crate::domain::ports::StateRepository;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_create_state_is_idempotent() {
        let store = PaymentStateStore::default();
        let first = store.create_state("order-1", PaymentMethod::Card).await.unwrap();
        store
            .update_state(
                "order-1",
                StatePatch::status(PaymentStatus::Approved)
                    .with_transaction_id(TransactionIdSource::GatewayResponse, "tx-1"),
            )
            .await
            .unwrap();

        let second = store.create_state("order-1", PaymentMethod::Cash).await.unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.method, PaymentMethod::Card);
        assert_eq!(second.status, PaymentStatus::Approved);
    }

    #[tokio::test]
    async fn test_update_unknown_order_is_not_found() {
        let store = PaymentStateStore::default();
        let result = store
            .update_state("missing", StatePatch::status(PaymentStatus::Approved))
            .await;
        assert!(matches!(result, Err(PaymentError::NotFound(id)) if id == "missing"));
        assert!(store.get_state("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_update_bumps_updated_at() {
        let store = PaymentStateStore::default();
        let created = store.create_state("order-1", PaymentMethod::Nequi).await.unwrap();
        let updated = store
            .update_state("order-1", StatePatch::default().checked_at(Utc::now()))
            .await
            .unwrap();
        assert!(updated.updated_at >= created.updated_at);
        assert!(updated.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_subscribers_fan_out_once_each() {
        let store = PaymentStateStore::default();
        store.create_state("order-1", PaymentMethod::Pse).await.unwrap();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&first);
        let s = Arc::clone(&second);
        let sub1 = store.subscribe("order-1", move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let sub2 = store.subscribe("order-1", move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        store
            .update_state("order-1", StatePatch::default().checked_at(Utc::now()))
            .await
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        sub1.unsubscribe();
        sub2.unsubscribe();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_notifications() {
        let store = PaymentStateStore::default();
        store.create_state("order-1", PaymentMethod::Nequi).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let sub = store.subscribe("order-1", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.subscriber_count("order-1"), 1);

        sub.unsubscribe();
        assert_eq!(store.subscriber_count("order-1"), 0);

        store
            .update_state("order-1", StatePatch::default().checked_at(Utc::now()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribers_are_scoped_to_order() {
        let store = PaymentStateStore::default();
        store.create_state("order-1", PaymentMethod::Nequi).await.unwrap();
        store.create_state("order-2", PaymentMethod::Nequi).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let _sub = store.subscribe("order-2", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        store
            .update_state("order-1", StatePatch::default().checked_at(Utc::now()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backward_transition_rejected() {
        let store = PaymentStateStore::default();
        store.create_state("order-1", PaymentMethod::Card).await.unwrap();
        store
            .update_state(
                "order-1",
                StatePatch::status(PaymentStatus::Confirmed)
                    .with_transaction_id(TransactionIdSource::GatewayResponse, "tx-1"),
            )
            .await
            .unwrap();

        let result = store
            .update_state("order-1", StatePatch::status(PaymentStatus::Approved))
            .await;
        assert!(matches!(result, Err(PaymentError::InvalidTransition { .. })));
        assert_eq!(
            store.get_state("order-1").await.unwrap().status,
            PaymentStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn test_reset_only_after_error() {
        let store = PaymentStateStore::default();
        store.create_state("order-1", PaymentMethod::Card).await.unwrap();
        store
            .update_state(
                "order-1",
                StatePatch::status(PaymentStatus::Approved)
                    .with_transaction_id(TransactionIdSource::GatewayResponse, "tx-1"),
            )
            .await
            .unwrap();

        let result = store.reset_state("order-1", PaymentMethod::Card).await;
        assert!(matches!(result, Err(PaymentError::InvalidTransition { .. })));

        store
            .update_state("order-1", StatePatch::error("Declined"))
            .await
            .unwrap();

        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        let _sub = store.subscribe("order-1", move |event| {
            e.lock().unwrap().push(event.clone());
        });

        let fresh = store.reset_state("order-1", PaymentMethod::Nequi).await.unwrap();
        assert_eq!(fresh.status, PaymentStatus::Pending);
        assert_eq!(fresh.transaction_id, None);
        assert_eq!(fresh.attempt, 2);
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [PaymentEvent::AttemptRestarted { .. }]
        ));
    }

    #[tokio::test]
    async fn test_reset_pending_without_transaction() {
        let store = PaymentStateStore::default();
        store.create_state("order-1", PaymentMethod::Widget).await.unwrap();

        let fresh = store.reset_state("order-1", PaymentMethod::Card).await.unwrap();
        assert_eq!(fresh.method, PaymentMethod::Card);
        assert_eq!(fresh.attempt, 2);

        store
            .update_state(
                "order-1",
                StatePatch::default().with_transaction_id(TransactionIdSource::GatewayResponse, "tx-1"),
            )
            .await
            .unwrap();
        let result = store.reset_state("order-1", PaymentMethod::Nequi).await;
        assert!(matches!(result, Err(PaymentError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_updates_are_persisted_and_hydrated() {
        let repo = InMemoryStateRepository::new();
        let store = PaymentStateStore::new(Box::new(repo.clone()));
        store.create_state("order-1", PaymentMethod::Nequi).await.unwrap();
        store
            .update_state(
                "order-1",
                StatePatch::default().with_transaction_id(TransactionIdSource::Webhook, "tx-9"),
            )
            .await
            .unwrap();

        let persisted = repo.get("order-1").await.unwrap().unwrap();
        assert_eq!(persisted.transaction_id.as_deref(), Some("tx-9"));

        let restored = PaymentStateStore::new(Box::new(repo));
        assert_eq!(restored.hydrate().await.unwrap(), 1);
        assert_eq!(
            restored.get_state("order-1").await.unwrap().transaction_id.as_deref(),
            Some("tx-9")
        );
    }
}
