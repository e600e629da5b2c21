use paysync::application::store::PaymentStateStore;
use paysync::domain::payment::{
    PaymentEvent, PaymentMethod, PaymentState, PaymentStatus, StatePatch, TransactionIdSource,
};
use paysync::domain::ports::StateRepositoryBox;
use paysync::infrastructure::in_memory::InMemoryStateRepository;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test]
async fn test_repository_as_trait_object() {
    let repository: StateRepositoryBox = Box::new(InMemoryStateRepository::new());
    let state = PaymentState::new("order-1", PaymentMethod::Pse, chrono::Utc::now());

    // Verify Send + Sync by spawning tasks
    let handle = tokio::spawn(async move {
        repository.store(state).await.unwrap();
        repository.get("order-1").await.unwrap().unwrap()
    });

    let retrieved = handle.await.unwrap();
    assert_eq!(retrieved.order_id, "order-1");
    assert_eq!(retrieved.method, PaymentMethod::Pse);
}

#[tokio::test]
async fn test_shared_store_across_tasks() {
    let store = Arc::new(PaymentStateStore::default());
    let events = Arc::new(AtomicUsize::new(0));

    let counter = events.clone();
    let first = store.subscribe("order-1", move |event: &PaymentEvent| {
        if matches!(event, PaymentEvent::StateChanged { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    let counter = events.clone();
    let second = store.subscribe("order-1", move |_: &PaymentEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut creators = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        creators.push(tokio::spawn(async move {
            store.create_state("order-1", PaymentMethod::Nequi).await.unwrap()
        }));
    }
    let mut created_at = Vec::new();
    for creator in creators {
        created_at.push(creator.await.unwrap().created_at);
    }
    created_at.dedup();
    assert_eq!(created_at.len(), 1);
    assert_eq!(events.load(Ordering::SeqCst), 0);

    store
        .update_state(
            "order-1",
            StatePatch::status(PaymentStatus::Approved)
                .with_transaction_id(TransactionIdSource::GatewayResponse, "tx-1"),
        )
        .await
        .unwrap();
    assert_eq!(events.load(Ordering::SeqCst), 2);

    first.unsubscribe();
    second.unsubscribe();
    assert_eq!(store.subscriber_count("order-1"), 0);
}
