use super::store::{PaymentStateStore, Subscription};
use crate::domain::gateway::{
    CheckoutRequest, GatewayStatus, GatewayTransaction, RailPayload, TransactionRequest,
    WebhookEvent,
};
use crate::domain::payment::{
    PaymentEvent, PaymentMethod, PaymentState, PaymentStatus, StatePatch, TransactionIdSource,
    cash_transaction_id, resolve_transaction_id,
};
use crate::domain::ports::{ConfirmerRef, GatewayRef};
use crate::domain::request::{PaymentRequest, PaymentResult};
use crate::error::{PaymentError, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// What a reconciliation check did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// The state is PENDING but no transaction id is known yet.
    AwaitingTransactionId,
    AlreadyTerminal(PaymentStatus),
    Unchanged(PaymentStatus),
    Transitioned {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// The check failed transiently; the next poll retries it.
    Deferred(String),
    /// The input did not concern the current attempt.
    Ignored,
}

impl ReconcileOutcome {
    /// Whether the order has reached CONFIRMED or ERROR.
    pub fn is_terminal(&self) -> bool {
        match self {
            ReconcileOutcome::AlreadyTerminal(_) => true,
            ReconcileOutcome::Transitioned { to, .. } => to.is_terminal(),
            _ => false,
        }
    }
}

type OrderLocks = DashMap<String, Arc<Mutex<()>>>;

/// Holds an order's lock; the map entry goes away with the last holder.
struct OrderGuard<'a> {
    locks: &'a OrderLocks,
    order_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OrderGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Queued callers hold their own clone of the mutex.
        self.locks
            .remove_if(&self.order_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

enum Attempt {
    /// Go ahead and talk to the rail.
    Start(PaymentState),
    /// A transaction already exists for this order; do not charge again.
    InProgress(PaymentState),
}

/// Drives an order's payment from initiation to CONFIRMED or ERROR.
///
/// Every entry point that talks to the gateway for an order takes that
/// order's lock first, so at most one initiation or reconciliation check is
/// in flight per order. Callers that queue behind it re-read the state and
/// converge on the same result.
pub struct UnifiedPaymentService {
    store: Arc<PaymentStateStore>,
    gateway: GatewayRef,
    confirmer: ConfirmerRef,
    order_locks: OrderLocks,
}

impl UnifiedPaymentService {
    pub fn new(store: Arc<PaymentStateStore>, gateway: GatewayRef, confirmer: ConfirmerRef) -> Self {
        Self {
            store,
            gateway,
            confirmer,
            order_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<PaymentStateStore> {
        &self.store
    }

    pub async fn get_state(&self, order_id: &str) -> Option<PaymentState> {
        self.store.get_state(order_id).await
    }

    pub fn subscribe<F>(&self, order_id: &str, listener: F) -> Subscription
    where
        F: Fn(&PaymentEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(order_id, listener)
    }

    async fn lock_order(&self, order_id: &str) -> OrderGuard<'_> {
        let lock = Arc::clone(self.order_locks.entry(order_id.to_string()).or_default().value());
        OrderGuard {
            locks: &self.order_locks,
            order_id: order_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Starts (or resumes) the payment of an order.
    ///
    /// Never returns raw errors: failures are reported through
    /// [`PaymentResult::success`] and [`PaymentResult::error`], and any
    /// transaction id obtained before the failure stays recorded.
    pub async fn process_payment(&self, request: PaymentRequest) -> PaymentResult {
        if let Err(e) = request.validate() {
            tracing::warn!(order_id = %request.order_id, error = %e, "Rejected payment request");
            return PaymentResult::failed(&e, None);
        }

        let _guard = self.lock_order(&request.order_id).await;

        let state = match self.begin_attempt(&request).await {
            Ok(Attempt::Start(state)) => state,
            Ok(Attempt::InProgress(state)) => {
                tracing::debug!(
                    order_id = %request.order_id,
                    status = %state.status,
                    "Payment already in progress, not charging again"
                );
                return PaymentResult::succeeded(state);
            }
            Err(e) => {
                let current = self.store.get_state(&request.order_id).await;
                return PaymentResult::failed(&e, current);
            }
        };

        tracing::info!(
            order_id = %state.order_id,
            method = %request.method,
            attempt = state.attempt,
            "Processing payment"
        );

        let outcome = match request.method {
            PaymentMethod::Cash => self.process_cash(&request).await,
            PaymentMethod::Card => self.process_card(&request).await,
            PaymentMethod::Widget => Ok(PaymentResult::succeeded(state)),
            PaymentMethod::CheckoutWeb => self.process_checkout(&request, state),
            PaymentMethod::Nequi | PaymentMethod::Bancolombia | PaymentMethod::Pse => {
                self.process_async_rail(&request).await
            }
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(order_id = %request.order_id, error = %e, "Payment initiation failed");
                let current = self.store.get_state(&request.order_id).await;
                PaymentResult::failed(&e, current)
            }
        }
    }

    async fn begin_attempt(&self, request: &PaymentRequest) -> Result<Attempt> {
        let order_id = request.order_id.as_str();
        match self.store.get_state(order_id).await {
            None => Ok(Attempt::Start(
                self.store.create_state(order_id, request.method).await?,
            )),
            Some(state) if state.status == PaymentStatus::Error => Ok(Attempt::Start(
                self.store.reset_state(order_id, request.method).await?,
            )),
            Some(state)
                if state.status == PaymentStatus::Confirmed || state.transaction_id.is_some() =>
            {
                Ok(Attempt::InProgress(state))
            }
            Some(state) if state.method != request.method => Ok(Attempt::Start(
                self.store.reset_state(order_id, request.method).await?,
            )),
            Some(state) => Ok(Attempt::Start(state)),
        }
    }

    async fn process_cash(&self, request: &PaymentRequest) -> Result<PaymentResult> {
        // Settled in person at service delivery; no gateway round-trip.
        let id = cash_transaction_id(Utc::now());
        let state = self
            .store
            .update_state(
                &request.order_id,
                StatePatch::status(PaymentStatus::Confirmed)
                    .with_transaction_id(TransactionIdSource::Local, id),
            )
            .await?;
        Ok(PaymentResult::succeeded(state))
    }

    async fn process_card(&self, request: &PaymentRequest) -> Result<PaymentResult> {
        let card = request.card.as_ref().ok_or_else(|| {
            PaymentError::Validation("Card details are required for card payments".to_string())
        })?;
        let token = self.gateway.tokenize_card(card).await?;
        self.submit_transaction(
            request,
            RailPayload::Card {
                token,
                installments: card.installments.max(1),
            },
        )
        .await
    }

    fn process_checkout(&self, request: &PaymentRequest, state: PaymentState) -> Result<PaymentResult> {
        let url = self.gateway.checkout_url(&CheckoutRequest {
            reference: request.order_id.clone(),
            amount_in_cents: request.amount_in_cents()?,
            currency: request.currency.clone(),
            customer_email: request.customer_email.clone(),
            redirect_url: request.redirect_url.clone(),
        })?;
        Ok(PaymentResult::redirect(state, Some(url)))
    }

    async fn process_async_rail(&self, request: &PaymentRequest) -> Result<PaymentResult> {
        let description = format!("Order {}", request.order_id);
        let payload = match request.method {
            PaymentMethod::Nequi => RailPayload::Nequi {
                phone_number: request.phone_number.clone().unwrap_or_default(),
            },
            PaymentMethod::Bancolombia => RailPayload::BancolombiaTransfer {
                user_type: "PERSON".to_string(),
                payment_description: description,
            },
            PaymentMethod::Pse => {
                let bank = request.bank.as_ref().ok_or_else(|| {
                    PaymentError::Validation("Bank details are required for PSE".to_string())
                })?;
                RailPayload::Pse {
                    user_type: bank.user_type,
                    user_legal_id_type: bank.legal_id_type.clone(),
                    user_legal_id: bank.legal_id.clone(),
                    financial_institution_code: bank.financial_institution_code.clone(),
                    payment_description: description,
                }
            }
            other => {
                return Err(PaymentError::Validation(format!(
                    "{} is not an app-approval rail",
                    other
                )));
            }
        };
        self.submit_transaction(request, payload).await
    }

    async fn submit_transaction(
        &self,
        request: &PaymentRequest,
        payload: RailPayload,
    ) -> Result<PaymentResult> {
        let acceptance = self.gateway.acceptance_tokens().await?;
        let tx = self
            .gateway
            .create_transaction(&TransactionRequest {
                reference: request.order_id.clone(),
                amount_in_cents: request.amount_in_cents()?,
                currency: request.currency.clone(),
                customer_email: request.customer_email.clone(),
                acceptance_token: acceptance.acceptance_token,
                accept_personal_auth: acceptance.accept_personal_auth,
                payment_method: payload,
                redirect_url: request.redirect_url.clone(),
            })
            .await?;

        let state = self
            .apply_gateway_transaction(&request.order_id, &tx, TransactionIdSource::GatewayResponse)
            .await?;

        if state.status == PaymentStatus::Error {
            let reason = state.error.clone().unwrap_or_else(|| tx.status.to_string());
            tracing::warn!(order_id = %request.order_id, reason = %reason, "Payment declined");
            return Ok(PaymentResult::failed(
                &PaymentError::GatewayDecline(reason),
                Some(state),
            ));
        }
        Ok(match tx.redirect_url {
            Some(url) => PaymentResult::redirect(state, Some(url)),
            None => PaymentResult::succeeded(state),
        })
    }

    /// Records the transaction id and maps the gateway status onto the state.
    ///
    /// APPROVED is followed by the order confirmation step; PENDING only
    /// refreshes `last_checked_at`.
    async fn apply_gateway_transaction(
        &self,
        order_id: &str,
        tx: &GatewayTransaction,
        source: TransactionIdSource,
    ) -> Result<PaymentState> {
        let now = Utc::now();
        let base = StatePatch::default()
            .with_transaction_id(source, tx.id.clone())
            .checked_at(now);

        if tx.status.is_failure() {
            let message = tx
                .status_message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| default_failure_message(tx.status).to_string());
            return self
                .store
                .update_state(
                    order_id,
                    StatePatch {
                        status: Some(PaymentStatus::Error),
                        error: Some(message),
                        ..base
                    },
                )
                .await;
        }

        if tx.status != GatewayStatus::Approved {
            return self.store.update_state(order_id, base).await;
        }
        let approved = self
            .store
            .update_state(
                order_id,
                StatePatch {
                    status: Some(PaymentStatus::Approved),
                    ..base
                },
            )
            .await?;
        self.confirm(approved).await
    }

    /// Promotes an APPROVED state to CONFIRMED once the order backend accepts it.
    ///
    /// A failed confirmation leaves the state APPROVED; the next
    /// reconciliation check tries again.
    async fn confirm(&self, state: PaymentState) -> Result<PaymentState> {
        if state.status != PaymentStatus::Approved {
            return Ok(state);
        }
        let Some(transaction_id) = state.transaction_id.clone() else {
            return Ok(state);
        };

        match self
            .confirmer
            .confirm_order(&state.order_id, &transaction_id)
            .await
        {
            Ok(()) => {
                self.store
                    .update_state(&state.order_id, StatePatch::status(PaymentStatus::Confirmed))
                    .await
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(order_id = %state.order_id, error = %e, "Order confirmation deferred");
                Ok(state)
            }
            Err(e) => {
                tracing::error!(order_id = %state.order_id, error = %e, "Order confirmation rejected");
                Ok(state)
            }
        }
    }

    /// Asks the gateway for the latest status and applies it.
    ///
    /// Applying the same gateway answer twice is a no-op, and a stale answer
    /// that would move the state backward is dropped. Gateway failures are
    /// absorbed into [`ReconcileOutcome::Deferred`]; only an unknown order is
    /// an error.
    pub async fn check_and_update_payment_status(&self, order_id: &str) -> Result<ReconcileOutcome> {
        let _guard = self.lock_order(order_id).await;
        self.check_locked(order_id).await
    }

    async fn check_locked(&self, order_id: &str) -> Result<ReconcileOutcome> {
        let state = self
            .store
            .get_state(order_id)
            .await
            .ok_or_else(|| PaymentError::NotFound(order_id.to_string()))?;
        if state.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadyTerminal(state.status));
        }
        let Some(transaction_id) = state.transaction_id.clone() else {
            return Ok(ReconcileOutcome::AwaitingTransactionId);
        };

        let tx = match self.gateway.transaction_status(&transaction_id).await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(order_id, transaction_id = %transaction_id, error = %e, "Status check failed, will retry");
                return Ok(ReconcileOutcome::Deferred(e.to_string()));
            }
        };
        tracing::debug!(order_id, gateway_status = %tx.status, "Gateway status received");

        self.apply_reconciled(order_id, state.status, &tx, TransactionIdSource::GatewayResponse)
            .await
    }

    async fn apply_reconciled(
        &self,
        order_id: &str,
        from: PaymentStatus,
        tx: &GatewayTransaction,
        source: TransactionIdSource,
    ) -> Result<ReconcileOutcome> {
        match self.apply_gateway_transaction(order_id, tx, source).await {
            Ok(state) if state.status != from => Ok(ReconcileOutcome::Transitioned {
                from,
                to: state.status,
            }),
            Ok(state) => Ok(ReconcileOutcome::Unchanged(state.status)),
            Err(PaymentError::InvalidTransition { from, to }) => {
                tracing::debug!(order_id, %from, %to, "Dropped stale gateway status");
                Ok(ReconcileOutcome::Unchanged(from))
            }
            Err(e @ PaymentError::NotFound(_)) => Err(e),
            Err(e) => {
                tracing::warn!(order_id, error = %e, "Could not apply gateway status, will retry");
                Ok(ReconcileOutcome::Deferred(e.to_string()))
            }
        }
    }

    /// Records `id` unless the order already has a transaction id.
    pub async fn record_transaction_id(
        &self,
        order_id: &str,
        source: TransactionIdSource,
        id: &str,
    ) -> Result<PaymentState> {
        self.sync_transaction_id(order_id, &[(source, Some(id))]).await
    }

    /// Records a transaction id learned out of band.
    ///
    /// Candidates are consulted in source priority order and the first
    /// non-empty one is offered to the state, which keeps any id it already
    /// has. Ids of earlier attempts are skipped.
    pub async fn sync_transaction_id(
        &self,
        order_id: &str,
        candidates: &[(TransactionIdSource, Option<&str>)],
    ) -> Result<PaymentState> {
        let _guard = self.lock_order(order_id).await;
        self.sync_locked(order_id, candidates).await
    }

    async fn sync_locked(
        &self,
        order_id: &str,
        candidates: &[(TransactionIdSource, Option<&str>)],
    ) -> Result<PaymentState> {
        let state = self
            .store
            .get_state(order_id)
            .await
            .ok_or_else(|| PaymentError::NotFound(order_id.to_string()))?;
        let current: Vec<_> = candidates
            .iter()
            .copied()
            .filter(|(_, id)| !id.is_some_and(|id| state.is_superseded(id)))
            .collect();

        match resolve_transaction_id(&current) {
            Some((source, id)) => {
                self.store
                    .update_state(order_id, StatePatch::default().with_transaction_id(source, id))
                    .await
            }
            None => Ok(state),
        }
    }

    /// Handles the payer coming back from a redirect checkout.
    ///
    /// The gateway appends the transaction id as the `id` query parameter.
    pub async fn handle_redirect(
        &self,
        order_id: &str,
        query: &HashMap<String, String>,
    ) -> Result<ReconcileOutcome> {
        let _guard = self.lock_order(order_id).await;
        let id = query.get("id").map(String::as_str);

        let state = self
            .store
            .get_state(order_id)
            .await
            .ok_or_else(|| PaymentError::NotFound(order_id.to_string()))?;
        if let Some(id) = id
            && state.is_superseded(id)
        {
            tracing::warn!(order_id, transaction_id = %id, "Redirect for a superseded transaction");
            return Ok(ReconcileOutcome::Ignored);
        }

        self.sync_locked(order_id, &[(TransactionIdSource::RedirectQuery, id)])
            .await?;
        self.check_locked(order_id).await
    }

    /// Applies a `transaction.updated` webhook to the order named by its reference.
    pub async fn handle_webhook(&self, event: WebhookEvent) -> Result<ReconcileOutcome> {
        if event.event != "transaction.updated" {
            tracing::debug!(event = %event.event, "Ignoring webhook event");
            return Ok(ReconcileOutcome::Ignored);
        }
        let tx = event.data.transaction;
        let order_id = tx.reference.clone().ok_or_else(|| {
            PaymentError::Validation("Webhook transaction carries no reference".to_string())
        })?;

        let _guard = self.lock_order(&order_id).await;

        let state = self
            .store
            .get_state(&order_id)
            .await
            .ok_or_else(|| PaymentError::NotFound(order_id.clone()))?;
        let superseded = state.is_superseded(&tx.id)
            || state.transaction_id.as_ref().is_some_and(|current| *current != tx.id);
        if superseded {
            tracing::warn!(
                order_id = %order_id,
                current = state.transaction_id.as_deref().unwrap_or(""),
                webhook = %tx.id,
                "Webhook for a superseded transaction"
            );
            return Ok(ReconcileOutcome::Ignored);
        }
        if state.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadyTerminal(state.status));
        }

        self.apply_reconciled(&order_id, state.status, &tx, TransactionIdSource::Webhook)
            .await
    }
}

fn default_failure_message(status: GatewayStatus) -> &'static str {
    match status {
        GatewayStatus::Declined => "Payment declined",
        GatewayStatus::Voided => "Transaction voided",
        _ => "Gateway error",
    }
}
