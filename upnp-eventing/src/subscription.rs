//! The per-service subscription state machine.
//!
//! Transition methods never perform I/O. Each one checks the current state,
//! moves to the next, and, where the protocol requires it, returns the
//! [`Exchange`] the caller must run against the transport. Results of that
//! exchange are fed back through the matching `on_*` method.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::error::{EventingError, Result};
use crate::model::ServiceProxy;
use crate::notify::next_seq;
use crate::transport::SubscribeGrant;
use crate::types::{ServiceKey, Sid, SubscriptionHandle, SubscriptionStatus, Timeout};

/// Shortest time between a grant and the RENEW that refreshes it.
pub const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(1);

/// A network exchange requested by a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    Subscribe {
        event_url: Url,
        callback_url: Url,
        timeout: Timeout,
    },
    Renew {
        event_url: Url,
        sid: Sid,
        timeout: Timeout,
    },
    Unsubscribe {
        event_url: Url,
        sid: Sid,
    },
}

/// One service's subscription to a remote UPnP service.
pub struct Subscription {
    handle: SubscriptionHandle,
    service: Weak<dyn ServiceProxy>,
    key: ServiceKey,
    event_url: Url,
    requested: Timeout,
    state: SubscriptionStatus,
    sid: Option<Sid>,
    granted: Option<Timeout>,
    granted_at: Option<Instant>,
    expires_at: Option<Instant>,
    last_error: Option<EventingError>,
    expected_seq: u32,
    renewal_count: u32,
    renewal_timer: Option<JoinHandle<()>>,
    renewal_task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Create an `Idle` subscription for `service`.
    pub fn new(
        handle: SubscriptionHandle,
        service: &Arc<dyn ServiceProxy>,
        requested: Timeout,
    ) -> Self {
        Self {
            handle,
            service: Arc::downgrade(service),
            key: service.key(),
            event_url: service.event_sub_url(),
            requested,
            state: SubscriptionStatus::Idle,
            sid: None,
            granted: None,
            granted_at: None,
            expires_at: None,
            last_error: None,
            expected_seq: 0,
            renewal_count: 0,
            renewal_timer: None,
            renewal_task: None,
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.state
    }

    pub fn sid(&self) -> Option<&Sid> {
        self.sid.as_ref()
    }

    pub fn granted_timeout(&self) -> Option<Timeout> {
        self.granted
    }

    pub(crate) fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn last_error(&self) -> Option<&EventingError> {
        self.last_error.as_ref()
    }

    pub fn expected_seq(&self) -> u32 {
        self.expected_seq
    }

    pub fn renewal_count(&self) -> u32 {
        self.renewal_count
    }

    /// The owning service, if it is still alive.
    pub fn service(&self) -> Option<Arc<dyn ServiceProxy>> {
        self.service.upgrade()
    }

    pub fn accepts_events(&self) -> bool {
        self.state.accepts_events()
    }

    /// `Idle -> Subscribing`
    pub fn begin_subscribe(&mut self, callback_url: Url) -> Result<Exchange> {
        self.expect(&[SubscriptionStatus::Idle], "subscribe")?;
        self.state = SubscriptionStatus::Subscribing;
        Ok(Exchange::Subscribe {
            event_url: self.event_url.clone(),
            callback_url,
            timeout: self.requested,
        })
    }

    /// `Subscribing -> Subscribed`
    pub fn on_subscribed(&mut self, grant: SubscribeGrant, now: Instant) -> Result<()> {
        self.expect(&[SubscriptionStatus::Subscribing], "complete subscribe on")?;
        self.state = SubscriptionStatus::Subscribed;
        self.sid = Some(grant.sid);
        self.expected_seq = 0;
        self.last_error = None;
        self.refresh_expiration(grant.timeout, now);
        Ok(())
    }

    /// `Idle | Subscribing -> Failed`
    pub fn on_subscribe_failed(&mut self, error: EventingError) -> Result<()> {
        self.expect(
            &[SubscriptionStatus::Idle, SubscriptionStatus::Subscribing],
            "fail subscribe on",
        )?;
        self.fail(error);
        Ok(())
    }

    /// `Subscribed -> Renewing`
    pub fn begin_renew(&mut self) -> Result<Exchange> {
        self.expect(&[SubscriptionStatus::Subscribed], "renew")?;
        let sid = self.require_sid("renew")?;
        self.state = SubscriptionStatus::Renewing;
        Ok(Exchange::Renew {
            event_url: self.event_url.clone(),
            sid,
            timeout: self.requested,
        })
    }

    /// `Renewing -> Subscribed`. The SID is unchanged.
    pub fn on_renewed(&mut self, granted: Timeout, now: Instant) -> Result<()> {
        self.expect(&[SubscriptionStatus::Renewing], "complete renew on")?;
        self.state = SubscriptionStatus::Subscribed;
        self.renewal_count += 1;
        self.last_error = None;
        self.refresh_expiration(granted, now);
        Ok(())
    }

    /// `Renewing -> Failed`
    pub fn on_renew_failed(&mut self, error: EventingError) -> Result<()> {
        self.expect(&[SubscriptionStatus::Renewing], "fail renew on")?;
        self.fail(error);
        Ok(())
    }

    /// `Subscribed | Renewing -> Unsubscribing`
    pub fn begin_unsubscribe(&mut self) -> Result<Exchange> {
        self.expect(
            &[SubscriptionStatus::Subscribed, SubscriptionStatus::Renewing],
            "unsubscribe",
        )?;
        let sid = self.require_sid("unsubscribe")?;
        self.stop_renewal();
        self.state = SubscriptionStatus::Unsubscribing;
        Ok(Exchange::Unsubscribe {
            event_url: self.event_url.clone(),
            sid,
        })
    }

    /// `Unsubscribing -> Cancelled`, whatever the remote answered.
    pub fn on_unsubscribed(&mut self) -> Result<()> {
        self.expect(&[SubscriptionStatus::Unsubscribing], "complete unsubscribe on")?;
        self.state = SubscriptionStatus::Cancelled;
        Ok(())
    }

    /// Any live state `-> Cancelled` without network traffic.
    pub fn cancel_local(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(self.invalid("cancel"));
        }
        self.stop_renewal();
        self.state = SubscriptionStatus::Cancelled;
        Ok(())
    }

    /// When the renewal for the current grant should start. `None` for
    /// infinite grants or when not subscribed.
    ///
    /// Never earlier than [`MIN_RENEWAL_INTERVAL`] after the grant, so a
    /// device answering with tiny timeouts cannot drive back-to-back RENEWs.
    pub fn renewal_deadline(&self, threshold: Duration) -> Option<Instant> {
        let expires_at = self.expires_at?;
        let granted_at = self.granted_at?;
        let granted = self.granted?.as_duration()?;
        let margin = threshold.min(granted / 2);
        let deadline = expires_at.checked_sub(margin).unwrap_or(expires_at);
        Some(deadline.max(granted_at + MIN_RENEWAL_INTERVAL))
    }

    /// Record a NOTIFY sequence number. Returns the expected value when
    /// `seq` was out of order; the counter resynchronises either way.
    pub fn track_seq(&mut self, seq: u32) -> Option<u32> {
        let expected = self.expected_seq;
        self.expected_seq = next_seq(seq);
        (seq != expected).then_some(expected)
    }

    pub(crate) fn set_renewal_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(old) = self.renewal_timer.replace(timer) {
            old.abort();
        }
    }

    /// Track the task running the RENEW exchange and its retries.
    pub(crate) fn set_renewal_task(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.renewal_task.replace(task) {
            old.abort();
        }
    }

    /// Abort the renewal timer and any RENEW still being retried.
    pub(crate) fn stop_renewal(&mut self) {
        if let Some(timer) = self.renewal_timer.take() {
            timer.abort();
        }
        if let Some(task) = self.renewal_task.take() {
            task.abort();
        }
    }

    fn refresh_expiration(&mut self, granted: Timeout, now: Instant) {
        self.granted = Some(granted);
        self.granted_at = Some(now);
        self.expires_at = granted.as_duration().map(|d| now + d);
    }

    fn fail(&mut self, error: EventingError) {
        self.stop_renewal();
        self.state = SubscriptionStatus::Failed;
        self.last_error = Some(error);
    }

    fn expect(&self, allowed: &[SubscriptionStatus], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn require_sid(&self, operation: &'static str) -> Result<Sid> {
        self.sid.clone().ok_or_else(|| self.invalid(operation))
    }

    fn invalid(&self, operation: &'static str) -> EventingError {
        EventingError::InvalidTransition {
            state: self.state,
            operation,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("sid", &self.sid)
            .field("granted", &self.granted)
            .field("renewal_count", &self.renewal_count)
            .finish()
    }
}
