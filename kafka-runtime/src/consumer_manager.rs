//! Creates typed consumers, registers subscriptions, runs background
//! message-handler loops, and exposes commit/seek by (type, group).

use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use health::HealthHandle;
use serde::de::DeserializeOwned;
use siphasher::sip::SipHasher13;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::config::BrokerConfig;
use crate::consumer::TypedConsumer;
use crate::descriptor::Entity;
use crate::error::{MessagingError, MessagingResult};
use crate::keys::ConsumerKey;
use crate::observability;
use crate::pool::{ConsumerPool, PoolHealth};
use crate::schema::SchemaBinder;
use crate::types::{ConsumedBatch, ConsumedMessage, FetchOptions, SubscriptionOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SubscriptionState {
    Registered,
    Running,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionInfo {
    pub id: u64,
    pub entity_type_name: &'static str,
    pub group_id: String,
    pub state: SubscriptionState,
    pub started_at: DateTime<Utc>,
    pub messages_processed: u64,
    pub messages_failed: u64,
}

struct SubscriptionHandle {
    info: Mutex<SubscriptionInfo>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Process-wide consumer totals, mirroring `ProcessProducerStats`'s shape
/// for the same `Diagnostics()` symmetry on the read side.
#[derive(Default)]
pub struct ProcessConsumerStats {
    total_messages_consumed: AtomicU64,
    total_processing_time_micros: AtomicU64,
    last_throughput_calc: Mutex<Option<(Instant, u64, f64)>>,
}

impl ProcessConsumerStats {
    pub fn total_messages_consumed(&self) -> u64 {
        self.total_messages_consumed.load(Ordering::Relaxed)
    }

    pub fn average_processing_time(&self) -> Duration {
        let total = self.total_messages_consumed.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_processing_time_micros.load(Ordering::Relaxed) / total)
    }

    /// Messages/sec, recomputed at most once per 60s; memoized in between.
    pub fn throughput_per_second(&self) -> f64 {
        let mut guard = self.last_throughput_calc.lock().unwrap();
        let now = Instant::now();
        let current_total = self.total_messages_consumed.load(Ordering::Relaxed);
        match *guard {
            Some((last_calc, _, last_value)) if now.duration_since(last_calc) < Duration::from_secs(60) => {
                last_value
            }
            Some((last_calc, last_total, _)) => {
                let elapsed = now.duration_since(last_calc).as_secs_f64().max(1.0);
                let value = (current_total.saturating_sub(last_total)) as f64 / elapsed;
                *guard = Some((now, current_total, value));
                value
            }
            None => {
                *guard = Some((now, current_total, 0.0));
                0.0
            }
        }
    }

    pub fn record(&self, messages: u64, elapsed: Duration) {
        self.total_messages_consumed.fetch_add(messages, Ordering::Relaxed);
        self.total_processing_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Deterministic id from (entity type, group id, options), so subscribing
/// the same type to the same group twice with the same options is detected
/// as a duplicate rather than silently creating a second loop, while two
/// subscriptions that differ only in e.g. `auto_offset_reset` or
/// `max_poll_records` are treated as distinct. `options` is folded in via its
/// `Debug` rendering rather than a field-by-field hash, since
/// `SubscriptionOptions` carries no `Hash` impl and doesn't need one just for
/// this.
fn subscription_id<T: 'static>(group_id: &str, options: &SubscriptionOptions) -> u64 {
    let mut hasher = SipHasher13::new();
    std::any::TypeId::of::<T>().hash(&mut hasher);
    group_id.hash(&mut hasher);
    format!("{options:?}").hash(&mut hasher);
    hasher.finish()
}

pub struct ConsumerManager {
    pool: Arc<ConsumerPool>,
    binder: Arc<SchemaBinder>,
    broker: BrokerConfig,
    liveness: HealthHandle,
    subscriptions: Arc<DashMap<u64, SubscriptionHandle>>,
    stats: ProcessConsumerStats,
}

impl ConsumerManager {
    pub fn new(pool: Arc<ConsumerPool>, binder: Arc<SchemaBinder>, broker: BrokerConfig, liveness: HealthHandle) -> Self {
        Self {
            pool,
            binder,
            broker,
            liveness,
            subscriptions: Arc::new(DashMap::new()),
            stats: ProcessConsumerStats::default(),
        }
    }

    pub fn health(&self, overload_threshold: f64) -> PoolHealth {
        self.pool.health(overload_threshold)
    }

    pub fn pool(&self) -> &Arc<ConsumerPool> {
        &self.pool
    }

    pub fn stats(&self) -> &ProcessConsumerStats {
        &self.stats
    }

    /// Records a stream-side receive for the process-wide stats object;
    /// called from the façade's `Consume<T>` per decoded item, since
    /// `consume_stream` itself returns an owned (non-borrowing) stream that
    /// can't hold a reference back into the manager.
    pub fn record_consumed(&self, elapsed: Duration) {
        self.stats.record(1, elapsed);
    }

    pub fn subscription_snapshot(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().info.lock().unwrap().clone())
            .collect()
    }

    /// Rents a consumer for `(T, group_id)` outside of the subscription
    /// registry — used by the façade's `Fetch` and `Consume`, which pull
    /// directly rather than going through a handler loop. The caller is
    /// responsible for releasing the rental (`ConsumerPool::release`) once
    /// done with it, same as a subscription's loop does on exit.
    fn build_consumer<T>(&self, group_id: &str) -> MessagingResult<(ConsumerKey, Arc<TypedConsumer<T>>)>
    where
        T: Entity + DeserializeOwned,
    {
        let key = ConsumerKey::new::<T>(&self.broker, &T::descriptor().topic_name, group_id);
        let client = self.pool.rent(key, &self.broker, group_id, self.liveness.clone())?;
        Ok((key, Arc::new(TypedConsumer::<T>::new(client, self.binder.clone()))))
    }

    /// One-shot bounded pull: rents a disposable consumer with
    /// `enable.auto.offset.store=false` (the pool always sets this — see
    /// `ConsumerPool::rent`), drains a single batch, and releases the
    /// rental regardless of outcome. `max_messages=0` is a boundary case
    /// the façade short-circuits before ever calling this.
    /// Nested under the façade's `kafka.fetch_batch` span with its own
    /// `kafka.consume_batches`: the outer span marks "a `Fetch` call
    /// happened," the inner one marks "a bounded accumulate-until-full-or-
    /// timeout batch read actually ran" — the same operation `TypedConsumer
    /// ::consume_batch` exposes directly to e.g. a future batch-processing
    /// façade method, not just to `Fetch`'s disposable-consumer path.
    pub async fn fetch<T>(&self, group_id: &str, options: &FetchOptions) -> MessagingResult<ConsumedBatch<T>>
    where
        T: Entity + DeserializeOwned,
    {
        let span = observability::consume_batches_span(None);
        async move {
            let (key, consumer) = self.build_consumer::<T>(group_id)?;
            let cancel = CancellationToken::new();
            let started = Instant::now();
            let result = consumer.consume_batch(options, &cancel).await;
            self.pool.release(key);
            if let Ok(batch) = &result {
                self.stats.record(batch.messages.len() as u64, started.elapsed());
            }
            observability::record_outcome(&tracing::Span::current(), &result);
            result
        }
        .instrument(span)
        .await
    }

    /// Streams decoded messages for `(T, group_id)` until `cancel` fires or
    /// a fatal broker error occurs. The rented consumer is released once
    /// the stream ends, however it ends — cancellation, a fatal error, or
    /// the stream simply being dropped without being fully drained.
    pub fn consume_stream<T>(
        &self,
        group_id: &str,
        cancel: CancellationToken,
    ) -> MessagingResult<impl futures::Stream<Item = MessagingResult<ConsumedMessage<T>>>>
    where
        T: Entity + DeserializeOwned,
    {
        let (key, consumer) = self.build_consumer::<T>(group_id)?;
        let pool = self.pool.clone();

        struct StreamState<T: Entity + DeserializeOwned> {
            consumer: Arc<TypedConsumer<T>>,
            cancel: CancellationToken,
            pool: Arc<ConsumerPool>,
            key: ConsumerKey,
            released: bool,
        }

        impl<T: Entity + DeserializeOwned> Drop for StreamState<T> {
            fn drop(&mut self) {
                if !self.released {
                    self.pool.release(self.key);
                    self.released = true;
                }
            }
        }

        let state = StreamState { consumer, cancel, pool, key, released: false };

        Ok(futures::stream::unfold(state, |mut state| async move {
            match state.consumer.recv(&state.cancel).await {
                Some(outcome) => Some((outcome, state)),
                None => None,
            }
        }))
    }

    /// Builds a typed consumer, assigns it a deterministic id, stores the
    /// subscription, and starts its handler-loop task. `handler` is called
    /// once per decoded message; an `Err` is counted as a failed message
    /// and, if `options.stop_on_error`, ends the subscription.
    pub fn subscribe<T, F, Fut>(&self, options: SubscriptionOptions, handler: F) -> MessagingResult<u64>
    where
        T: Entity + DeserializeOwned,
        F: Fn(ConsumedMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let id = subscription_id::<T>(&options.group_id, &options);
        if self.subscriptions.contains_key(&id) {
            return Err(MessagingError::SubscriptionDuplicate(id));
        }

        let key = ConsumerKey::new::<T>(&self.broker, &T::descriptor().topic_name, &options.group_id);
        let client = self.pool.rent(key, &self.broker, &options.group_id, self.liveness.clone())?;
        let consumer = Arc::new(TypedConsumer::<T>::new(client, self.binder.clone()));
        let cancel = CancellationToken::new();

        let info = Mutex::new(SubscriptionInfo {
            id,
            entity_type_name: std::any::type_name::<T>(),
            group_id: options.group_id.clone(),
            state: SubscriptionState::Registered,
            started_at: Utc::now(),
            messages_processed: 0,
            messages_failed: 0,
        });

        let task = self.spawn_loop(id, options.stop_on_error, key, consumer, cancel.clone(), handler);

        self.subscriptions.insert(id, SubscriptionHandle { info, cancel, task });
        metrics::gauge!("subscription_active", "entity_type" => std::any::type_name::<T>()).increment(1.0);
        Ok(id)
    }

    fn spawn_loop<T, F, Fut>(
        &self,
        id: u64,
        stop_on_error: bool,
        key: ConsumerKey,
        consumer: Arc<TypedConsumer<T>>,
        cancel: CancellationToken,
        handler: F,
    ) -> tokio::task::JoinHandle<()>
    where
        T: Entity + DeserializeOwned,
        F: Fn(ConsumedMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let subscriptions = self.subscriptions.clone();
        let pool = self.pool.clone();
        let entity_type_name = std::any::type_name::<T>();

        tokio::spawn(async move {
            Self::set_state(&subscriptions, id, SubscriptionState::Running);

            loop {
                match consumer.recv(&cancel).await {
                    Some(Ok(message)) => match handler(message).await {
                        Ok(()) => {
                            Self::bump_processed(&subscriptions, id, true);
                            metrics::counter!("subscription_messages_processed_total", "success" => "true").increment(1);
                        }
                        Err(reason) => {
                            warn!(subscription_id = id, %reason, "subscription handler failed");
                            Self::bump_processed(&subscriptions, id, false);
                            metrics::counter!("subscription_messages_processed_total", "success" => "false").increment(1);
                            if stop_on_error {
                                break;
                            }
                        }
                    },
                    Some(Err(e)) => {
                        error!(subscription_id = id, error = %e, "fatal consume error, terminating subscription");
                        break;
                    }
                    None => {
                        info!(subscription_id = id, "subscription cancelled, terminating");
                        break;
                    }
                }
            }

            Self::set_state(&subscriptions, id, SubscriptionState::Draining);
            pool.release(key);
            subscriptions.remove(&id);
            metrics::gauge!("subscription_active", "entity_type" => entity_type_name).decrement(1.0);
        })
    }

    fn set_state(subscriptions: &DashMap<u64, SubscriptionHandle>, id: u64, state: SubscriptionState) {
        if let Some(handle) = subscriptions.get(&id) {
            handle.info.lock().unwrap().state = state;
        }
    }

    fn bump_processed(subscriptions: &DashMap<u64, SubscriptionHandle>, id: u64, success: bool) {
        if let Some(handle) = subscriptions.get(&id) {
            let mut info = handle.info.lock().unwrap();
            if success {
                info.messages_processed += 1;
            } else {
                info.messages_failed += 1;
            }
        }
    }

    /// Cancels every subscription matching `(T, group_id)`, if any. Since
    /// the subscription id now folds in `options` (§3's `Subscription.id =
    /// hash(entity_type, group_id, options)`), a caller that doesn't have
    /// the original `SubscriptionOptions` in hand can't recompute the exact
    /// id, so this scans the registry by the type name and group id instead
    /// — which also means it's the right call to make when more than one
    /// options-variant subscription shares a (T, group_id), since all of
    /// them are cancelled together. The handler loop observes cancellation
    /// cooperatively and tears itself down (see `spawn_loop`); this call
    /// does not block on that.
    pub fn unsubscribe<T: 'static>(&self, group_id: &str) -> bool {
        let entity_type_name = std::any::type_name::<T>();
        let mut cancelled_any = false;
        for entry in self.subscriptions.iter() {
            let matches = {
                let info = entry.value().info.lock().unwrap();
                info.entity_type_name == entity_type_name && info.group_id == group_id
            };
            if matches {
                entry.value().cancel.cancel();
                cancelled_any = true;
            }
        }
        cancelled_any
    }

    /// Cancels every active subscription and waits (best-effort, bounded)
    /// for their loops to finish draining.
    pub async fn dispose(&self) {
        let handles: Vec<_> = self
            .subscriptions
            .iter()
            .map(|entry| entry.value().cancel.clone())
            .collect();
        for cancel in handles {
            cancel.cancel();
        }
        // Loop tasks remove themselves from the map on exit; give them a
        // bounded window to do so rather than blocking shutdown forever on
        // a wedged handler.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while !self.subscriptions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        if !self.subscriptions.is_empty() {
            warn!(remaining = self.subscriptions.len(), "subscriptions still draining at shutdown deadline");
        }
    }
}

impl Drop for ConsumerManager {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            entry.value().cancel.cancel();
            entry.value().task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_id_is_stable_and_group_scoped() {
        struct Order;
        let options = SubscriptionOptions::default();
        assert_eq!(
            subscription_id::<Order>("g1", &options),
            subscription_id::<Order>("g1", &options)
        );
        assert_ne!(
            subscription_id::<Order>("g1", &options),
            subscription_id::<Order>("g2", &options)
        );
    }

    #[test]
    fn subscription_id_distinguishes_by_options() {
        struct Order;
        let defaults = SubscriptionOptions::default();
        let earliest = SubscriptionOptions {
            auto_offset_reset: crate::types::AutoOffsetReset::Earliest,
            ..SubscriptionOptions::default()
        };
        assert_ne!(
            subscription_id::<Order>("g1", &defaults),
            subscription_id::<Order>("g1", &earliest)
        );
    }
}
