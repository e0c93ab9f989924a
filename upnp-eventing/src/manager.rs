//! The subscription manager.
//!
//! [`SubscriptionManager`] owns the [`SubscriptionIndex`] and is the only
//! component that mutates it. Public operations take the index write lock
//! for their structural changes and hand any network exchange to a spawned
//! task. Results of those tasks come back as completions over an mpsc
//! channel and are applied by a single worker task, so network results and
//! caller operations are serialised through the same lock.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = SubscriptionManager::new(transport, EventingConfig::default())?;
//! let mut events = manager.event_stream().expect("first call");
//!
//! manager.subscribe_device(device.as_ref(), VisitMode::Recursive, None).await;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

mod exchange;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::config::EventingConfig;
use crate::error::{EventingError, Result, TransportError};
use crate::event::SubscriptionEvent;
use crate::index::SubscriptionIndex;
use crate::model::{collect_device_ids, collect_services, DeviceProxy, ServiceProxy};
use crate::notify::{NotifyRequest, NotifyStatus};
use crate::subscription::{Exchange, Subscription};
use crate::transport::{EventTransport, SubscribeGrant};
use crate::types::{
    Sid, SubscribeOutcome, SubscriptionHandle, SubscriptionStatus, Timeout, VisitMode,
};

use exchange::Completion;

/// Manages GENA subscriptions for any number of services and device trees.
///
/// Dropping the manager stops its worker and every renewal timer. Exchanges
/// already in flight run to completion but their results are discarded.
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: Arc<EventingConfig>,
    transport: Arc<dyn EventTransport>,
    index: RwLock<SubscriptionIndex>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    event_tx: mpsc::UnboundedSender<SubscriptionEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionEvent>>>,
    /// Signalled whenever an UNSUBSCRIBE exchange finishes
    unsubscribe_done: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Set once [`SubscriptionManager::shutdown`] has stopped the worker
    shut_down: AtomicBool,
}

impl SubscriptionManager {
    /// Create a manager sending requests through `transport`.
    ///
    /// Must be called from within a tokio runtime: the completion worker is
    /// spawned immediately.
    pub fn new(transport: Arc<dyn EventTransport>, config: EventingConfig) -> Result<Self> {
        config.validate()?;

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ManagerInner {
            config: Arc::new(config),
            transport,
            index: RwLock::new(SubscriptionIndex::new()),
            completion_tx,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            unsubscribe_done: Notify::new(),
            worker: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let worker = tokio::spawn(run_worker(Arc::downgrade(&inner), completion_rx));
        *inner.worker.lock() = Some(worker);

        tracing::info!("Subscription manager started");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &EventingConfig {
        &self.inner.config
    }

    /// Take the observer event receiver. Returns `None` after the first call.
    ///
    /// Events are buffered until the receiver is taken.
    pub fn event_stream(&self) -> Option<mpsc::UnboundedReceiver<SubscriptionEvent>> {
        self.inner.event_rx.lock().take()
    }

    /// Subscribe to a single service.
    ///
    /// `Success` means an attempt was started; whether it succeeded is
    /// reported later as [`SubscriptionEvent::Subscribed`] or
    /// [`SubscriptionEvent::SubscriptionFailed`]. `timeout` defaults to
    /// [`EventingConfig::default_timeout`].
    pub async fn subscribe(
        &self,
        service: &Arc<dyn ServiceProxy>,
        timeout: Option<Timeout>,
    ) -> SubscribeOutcome {
        let key = service.key();

        if !service.is_evented() {
            tracing::debug!("Skipping subscribe: {}", EventingError::NotEvented(key));
            return SubscribeOutcome::FailedNotEvented;
        }

        let timeout =
            timeout.unwrap_or_else(|| Timeout::from_duration(self.inner.config.default_timeout));

        let mut index = self.inner.index.write().await;
        if index.find_by_service(&key).is_some() {
            tracing::debug!("Service {} already has a subscription", key);
            return SubscribeOutcome::AlreadySubscribed;
        }

        let handle = index.allocate_handle();
        let mut subscription = Subscription::new(handle, service, timeout);

        // Nothing would apply the SUBSCRIBE result once the worker is gone
        let callback_url = if self.inner.shut_down.load(Ordering::Acquire) {
            Err(EventingError::ShutDown)
        } else {
            self.inner
                .callback_url(service.as_ref(), handle)
                .ok_or_else(|| EventingError::NoCallbackRoot(key.clone()))
        };

        let callback_url = match callback_url {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!("Cannot subscribe to {}: {}", key, error);
                if subscription.on_subscribe_failed(error.clone()).is_ok() {
                    index.insert(subscription);
                    index.prune(handle);
                }
                self.inner.emit(SubscriptionEvent::SubscriptionFailed {
                    service: key,
                    error,
                });
                return SubscribeOutcome::Success;
            }
        };

        match subscription.begin_subscribe(callback_url) {
            Ok(exchange) => {
                tracing::debug!("Subscribing to {} ({})", key, handle);
                index.insert(subscription);
                self.inner.dispatch(handle, exchange, None);
            }
            Err(e) => tracing::error!("Failed to start subscription for {}: {}", key, e),
        }

        SubscribeOutcome::Success
    }

    /// Subscribe to every evented service of `device`, and of its embedded
    /// devices when `mode` is [`VisitMode::Recursive`].
    ///
    /// The tree is walked depth-first, services before child devices. The
    /// sweep always covers the whole tree. Returns true if at least one
    /// attempt was started.
    pub async fn subscribe_device(
        &self,
        device: &dyn DeviceProxy,
        mode: VisitMode,
        timeout: Option<Timeout>,
    ) -> bool {
        let mut started = false;

        for service in collect_services(device, mode) {
            if !service.is_evented() {
                continue;
            }
            if self.subscribe(&service, timeout).await == SubscribeOutcome::Success {
                started = true;
            }
        }

        tracing::debug!(
            "Subscribe sweep over {} ({:?}) started attempts: {}",
            device.device_id(),
            mode,
            started
        );
        started
    }

    /// Current state of the service's subscription.
    pub async fn subscription_status(&self, service: &dyn ServiceProxy) -> SubscriptionStatus {
        self.inner.index.read().await.status(&service.key())
    }

    /// SID granted to the service's live subscription, if any.
    pub async fn subscription_sid(&self, service: &dyn ServiceProxy) -> Option<Sid> {
        let index = self.inner.index.read().await;
        index
            .find_by_service(&service.key())
            .and_then(|handle| index.get(handle))
            .and_then(|s| s.sid().cloned())
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.index.read().await.len()
    }

    /// Cancel the service's subscription.
    ///
    /// With `unsubscribe` set, an established subscription sends UNSUBSCRIBE
    /// and reaches `Cancelled` when the exchange finishes, whatever the
    /// outcome. Otherwise, and for subscriptions still waiting for their
    /// SID, it is cancelled locally. Returns false if there is no live
    /// subscription.
    pub async fn cancel(&self, service: &dyn ServiceProxy, unsubscribe: bool) -> bool {
        let key = service.key();
        let mut index = self.inner.index.write().await;

        match index.find_by_service(&key) {
            Some(handle) => self.inner.cancel_locked(&mut index, handle, unsubscribe),
            None => false,
        }
    }

    /// Cancel every subscription of `device` (and its embedded devices when
    /// `mode` is recursive). Returns true if at least one was affected.
    pub async fn cancel_device(
        &self,
        device: &dyn DeviceProxy,
        mode: VisitMode,
        unsubscribe: bool,
    ) -> bool {
        let devices = collect_device_ids(device, mode);
        let mut index = self.inner.index.write().await;
        let mut affected = false;

        for device_id in &devices {
            for handle in index.handles_for_device(device_id) {
                affected |= self.inner.cancel_locked(&mut index, handle, unsubscribe);
            }
        }

        affected
    }

    /// Cancel every subscription, sending UNSUBSCRIBE where a SID is known.
    ///
    /// Waits at most `max_wait` for the UNSUBSCRIBE exchanges. Whatever is
    /// still outstanding at the deadline is forced to `Cancelled`.
    pub async fn cancel_all(&self, max_wait: Duration) {
        let deadline = Instant::now() + max_wait;

        let mut pending: Vec<SubscriptionHandle> = {
            let mut index = self.inner.index.write().await;
            for handle in index.handles() {
                self.inner.cancel_locked(&mut index, handle, true);
            }
            let unsubscribing: Vec<SubscriptionHandle> = index
                .handles()
                .into_iter()
                .filter(|h| Self::is_unsubscribing(&index, *h))
                .collect();
            unsubscribing
        };

        tracing::info!(
            "Cancelling all subscriptions, waiting for {} UNSUBSCRIBE requests",
            pending.len()
        );

        loop {
            // Created before the check so a completion in between is not missed
            let notified = self.inner.unsubscribe_done.notified();

            {
                let index = self.inner.index.read().await;
                pending.retain(|h| Self::is_unsubscribing(&index, *h));
            }
            if pending.is_empty() {
                break;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        if pending.is_empty() {
            return;
        }

        tracing::warn!(
            "{} UNSUBSCRIBE requests still outstanding after {:?}, cancelling locally",
            pending.len(),
            max_wait
        );

        let mut index = self.inner.index.write().await;
        for handle in pending {
            let Some(subscription) = index.get_mut(handle) else {
                continue;
            };
            if subscription.status() != SubscriptionStatus::Unsubscribing {
                continue;
            }
            let key = subscription.key().clone();
            if subscription.cancel_local().is_ok() {
                index.prune(handle);
                self.inner.emit(SubscriptionEvent::Unsubscribed { service: key });
            }
        }
    }

    /// Forget the service's subscription and recorded outcome without any
    /// network traffic. Returns true if anything was removed.
    pub async fn remove(&self, service: &dyn ServiceProxy) -> bool {
        let key = service.key();
        let removed = self.inner.index.write().await.remove_service(&key);
        if removed {
            tracing::debug!("Removed subscription state for {}", key);
        }
        removed
    }

    /// Forget every subscription of `device`, and of its embedded devices
    /// when `recursive` is set. Returns true if anything was removed.
    pub async fn remove_device(&self, device: &dyn DeviceProxy, recursive: bool) -> bool {
        let mode = if recursive {
            VisitMode::Recursive
        } else {
            VisitMode::ThisOnly
        };
        let devices = collect_device_ids(device, mode);

        let mut index = self.inner.index.write().await;
        let mut removed = false;
        for device_id in &devices {
            removed |= index.remove_device(device_id);
        }

        tracing::debug!(
            "Removed subscription state for {} device(s) under {}: {}",
            devices.len(),
            device.device_id(),
            removed
        );
        removed
    }

    /// Forget every subscription.
    pub async fn remove_all(&self) {
        let count = self.inner.index.write().await.clear();
        tracing::debug!("Removed {} subscriptions", count);
    }

    /// Route a NOTIFY request to the subscription identified by `sid`.
    ///
    /// The index lock is held only for the lookup and sequence bookkeeping;
    /// the changes are delivered to the service after it is released.
    pub async fn on_notify(&self, sid: &Sid, request: &NotifyRequest) -> NotifyStatus {
        let service = {
            let mut index = self.inner.index.write().await;

            let Some(subscription) = index
                .find_by_sid(sid)
                .and_then(|handle| index.get_mut(handle))
            else {
                tracing::warn!(
                    "Rejected NOTIFY: {}",
                    EventingError::UnknownSubscription(sid.clone())
                );
                return NotifyStatus::PreconditionFailed;
            };

            if !subscription.accepts_events() {
                tracing::debug!(
                    "NOTIFY for SID {} rejected in state {}",
                    sid,
                    subscription.status()
                );
                return NotifyStatus::PreconditionFailed;
            }

            let Some(service) = subscription.service() else {
                tracing::debug!("NOTIFY for SID {} after its service was dropped", sid);
                return NotifyStatus::PreconditionFailed;
            };

            if let Some(expected) = subscription.track_seq(request.seq) {
                tracing::warn!(
                    "NOTIFY sequence mismatch for SID {}: expected {}, received {}",
                    sid,
                    expected,
                    request.seq
                );
            }

            service
        };

        service.on_state_changes(&request.changes);
        NotifyStatus::Ok
    }

    /// Cancel everything within [`EventingConfig::shutdown_wait`], then stop
    /// the worker and all renewals. Completions arriving afterwards are
    /// dropped, and later subscribe attempts fail with
    /// [`EventingError::ShutDown`]. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!("Subscription manager already shut down");
            return;
        }

        tracing::info!("Shutting down subscription manager");
        self.cancel_all(self.inner.config.shutdown_wait).await;

        if let Some(worker) = self.inner.worker.lock().take() {
            worker.abort();
        }

        let mut index = self.inner.index.write().await;
        for handle in index.handles() {
            if let Some(subscription) = index.get_mut(handle) {
                subscription.stop_renewal();
            }
        }
        tracing::info!("Subscription manager shut down");
    }

    fn is_unsubscribing(index: &SubscriptionIndex, handle: SubscriptionHandle) -> bool {
        index
            .get(handle)
            .is_some_and(|s| s.status() == SubscriptionStatus::Unsubscribing)
    }
}

impl ManagerInner {
    fn emit(&self, event: SubscriptionEvent) {
        tracing::debug!("Emitting {} for {}", event.event_type(), event.service());
        // Nobody listening is fine
        let _ = self.event_tx.send(event);
    }

    fn callback_url(&self, service: &dyn ServiceProxy, handle: SubscriptionHandle) -> Option<Url> {
        let mut url = self.transport.callback_root(&service.device_locations())?;
        let path = format!(
            "{}{}/{}",
            url.path().trim_end_matches('/'),
            self.config.callback_path,
            handle.as_u64()
        );
        url.set_path(&path);
        Some(url)
    }

    fn dispatch(
        &self,
        handle: SubscriptionHandle,
        exchange: Exchange,
        expires_at: Option<Instant>,
    ) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let config = self.config.clone();
        let completion_tx = self.completion_tx.clone();

        tokio::spawn(async move {
            let completion = exchange::run(transport, config, handle, exchange, expires_at).await;
            let _ = completion_tx.send(completion);
        })
    }

    fn schedule_renewal(&self, subscription: &mut Subscription) {
        let Some(deadline) = subscription.renewal_deadline(self.config.renewal_threshold) else {
            return;
        };

        let handle = subscription.handle();
        let completion_tx = self.completion_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = completion_tx.send(Completion::RenewDue { handle });
        });
        subscription.set_renewal_timer(timer);
    }

    /// Cancel one subscription under an already held write lock.
    fn cancel_locked(
        &self,
        index: &mut SubscriptionIndex,
        handle: SubscriptionHandle,
        unsubscribe: bool,
    ) -> bool {
        let Some(subscription) = index.get_mut(handle) else {
            return false;
        };
        let key = subscription.key().clone();

        if unsubscribe {
            match subscription.status() {
                SubscriptionStatus::Unsubscribing => return true,
                SubscriptionStatus::Subscribed | SubscriptionStatus::Renewing => {
                    match subscription.begin_unsubscribe() {
                        Ok(exchange) => {
                            tracing::debug!("Unsubscribing {} ({})", key, handle);
                            self.dispatch(handle, exchange, None);
                            return true;
                        }
                        Err(e) => tracing::warn!("Cannot unsubscribe {}: {}", key, e),
                    }
                }
                _ => {}
            }
        }

        if let Err(e) = subscription.cancel_local() {
            tracing::debug!("Cannot cancel {}: {}", key, e);
            return false;
        }
        index.prune(handle);
        tracing::debug!("Cancelled subscription for {} locally", key);
        true
    }

    async fn apply(&self, completion: Completion) {
        match completion {
            Completion::Subscribed {
                handle,
                event_url,
                result,
            } => self.on_subscribe_result(handle, event_url, result).await,
            Completion::RenewDue { handle } => self.on_renew_due(handle).await,
            Completion::Renewed { handle, result } => self.on_renew_result(handle, result).await,
            Completion::Unsubscribed { handle, result } => {
                if let Err(e) = result {
                    tracing::debug!("UNSUBSCRIBE for {} failed: {}", handle, e);
                }
                self.on_unsubscribed(handle).await;
                self.unsubscribe_done.notify_waiters();
            }
        }
    }

    async fn on_subscribe_result(
        &self,
        handle: SubscriptionHandle,
        event_url: Url,
        result: std::result::Result<SubscribeGrant, TransportError>,
    ) {
        let mut index = self.index.write().await;

        let Some(subscription) = index.get_mut(handle) else {
            // Cancelled or removed while SUBSCRIBE was in flight
            if let Ok(grant) = result {
                tokio::spawn(exchange::release_orphan(
                    self.transport.clone(),
                    event_url,
                    grant.sid,
                ));
            }
            return;
        };
        let key = subscription.key().clone();

        match result {
            Ok(grant) => {
                let sid = grant.sid.clone();
                let timeout = grant.timeout;
                if let Err(e) = subscription.on_subscribed(grant, Instant::now()) {
                    tracing::debug!("Ignoring SUBSCRIBE result for {}: {}", key, e);
                    tokio::spawn(exchange::release_orphan(self.transport.clone(), event_url, sid));
                    return;
                }
                self.schedule_renewal(subscription);
                index.index_sid(handle);

                tracing::info!("Subscribed to {} (SID {}, {})", key, sid, timeout);
                self.emit(SubscriptionEvent::Subscribed {
                    service: key,
                    sid,
                    timeout,
                });
            }
            Err(e) => {
                let error = EventingError::from(e);
                if subscription.on_subscribe_failed(error.clone()).is_err() {
                    return;
                }
                index.prune(handle);

                tracing::warn!("Subscription to {} failed: {}", key, error);
                self.emit(SubscriptionEvent::SubscriptionFailed {
                    service: key,
                    error,
                });
            }
        }
    }

    async fn on_renew_due(&self, handle: SubscriptionHandle) {
        let mut index = self.index.write().await;
        let Some(subscription) = index.get_mut(handle) else {
            return;
        };
        if subscription.status() != SubscriptionStatus::Subscribed {
            return;
        }

        match subscription.begin_renew() {
            Ok(exchange) => {
                tracing::debug!("Renewing subscription for {}", subscription.key());
                let expires_at = subscription.expires_at();
                let task = self.dispatch(handle, exchange, expires_at);
                // Aborted if the subscription is cancelled between retries
                subscription.set_renewal_task(task);
            }
            Err(e) => tracing::debug!("Cannot renew {}: {}", subscription.key(), e),
        }
    }

    async fn on_renew_result(
        &self,
        handle: SubscriptionHandle,
        result: std::result::Result<Timeout, EventingError>,
    ) {
        let mut index = self.index.write().await;
        let Some(subscription) = index.get_mut(handle) else {
            return;
        };
        if subscription.status() != SubscriptionStatus::Renewing {
            // Cancelled while the RENEW was in flight
            return;
        }
        let key = subscription.key().clone();

        match result {
            Ok(timeout) => {
                if subscription.on_renewed(timeout, Instant::now()).is_err() {
                    return;
                }
                self.schedule_renewal(subscription);
                tracing::debug!("Renewed subscription for {} ({})", key, timeout);
                self.emit(SubscriptionEvent::Renewed {
                    service: key,
                    timeout,
                });
            }
            Err(error) => {
                if subscription.on_renew_failed(error.clone()).is_err() {
                    return;
                }
                index.prune(handle);
                tracing::warn!("Lost subscription for {}: {}", key, error);
                self.emit(SubscriptionEvent::SubscriptionLost {
                    service: key,
                    error,
                });
            }
        }
    }

    async fn on_unsubscribed(&self, handle: SubscriptionHandle) {
        let mut index = self.index.write().await;
        let Some(subscription) = index.get_mut(handle) else {
            return;
        };
        if subscription.on_unsubscribed().is_err() {
            return;
        }
        let key = subscription.key().clone();
        index.prune(handle);

        tracing::debug!("Unsubscribed from {}", key);
        self.emit(SubscriptionEvent::Unsubscribed { service: key });
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

async fn run_worker(inner: Weak<ManagerInner>, mut completion_rx: mpsc::UnboundedReceiver<Completion>) {
    tracing::debug!("Subscription worker started");

    while let Some(completion) = completion_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply(completion).await;
    }

    tracing::debug!("Subscription worker stopped");
}
