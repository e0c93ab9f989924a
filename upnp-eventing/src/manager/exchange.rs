//! Running network exchanges and reporting their results.
//!
//! Exchanges run on spawned tasks. They never touch the index; each one ends
//! by sending a [`Completion`] to the manager's worker.

use std::sync::Arc;

use tokio::time::Instant;
use url::Url;

use crate::config::EventingConfig;
use crate::error::{EventingError, TransportError};
use crate::subscription::Exchange;
use crate::transport::{EventTransport, SubscribeGrant};
use crate::types::{Sid, SubscriptionHandle, Timeout};

/// Results delivered to the worker, the only place they mutate the index.
#[derive(Debug)]
pub(crate) enum Completion {
    Subscribed {
        handle: SubscriptionHandle,
        event_url: Url,
        result: Result<SubscribeGrant, TransportError>,
    },
    RenewDue {
        handle: SubscriptionHandle,
    },
    Renewed {
        handle: SubscriptionHandle,
        result: Result<Timeout, EventingError>,
    },
    Unsubscribed {
        handle: SubscriptionHandle,
        result: Result<(), TransportError>,
    },
}

/// Perform `exchange` and describe the outcome.
///
/// `expires_at` bounds renewal retries: no retry is scheduled past the
/// moment the subscription would lapse anyway.
pub(crate) async fn run(
    transport: Arc<dyn EventTransport>,
    config: Arc<EventingConfig>,
    handle: SubscriptionHandle,
    exchange: Exchange,
    expires_at: Option<Instant>,
) -> Completion {
    match exchange {
        Exchange::Subscribe {
            event_url,
            callback_url,
            timeout,
        } => {
            tracing::debug!("SUBSCRIBE {} (callback {}, {})", event_url, callback_url, timeout);
            let result = transport.subscribe(&event_url, &callback_url, timeout).await;
            Completion::Subscribed {
                handle,
                event_url,
                result,
            }
        }
        Exchange::Renew {
            event_url,
            sid,
            timeout,
        } => {
            let result = renew_with_retry(
                transport.as_ref(),
                &config,
                &event_url,
                &sid,
                timeout,
                expires_at,
            )
            .await;
            Completion::Renewed { handle, result }
        }
        Exchange::Unsubscribe { event_url, sid } => {
            tracing::debug!("UNSUBSCRIBE {} (SID {})", event_url, sid);
            let result = transport.unsubscribe(&event_url, &sid).await;
            Completion::Unsubscribed { handle, result }
        }
    }
}

/// Renew with exponential backoff.
///
/// - Attempt 1: immediate
/// - Attempt 2: after `retry_backoff_base`
/// - Attempt 3: after `retry_backoff_base * 2`
/// - etc.
///
/// A 412 means the remote no longer knows the SID, so it is not retried.
async fn renew_with_retry(
    transport: &dyn EventTransport,
    config: &EventingConfig,
    event_url: &Url,
    sid: &Sid,
    timeout: Timeout,
    expires_at: Option<Instant>,
) -> Result<Timeout, EventingError> {
    let mut attempt = 1;

    loop {
        tracing::debug!("RENEW {} (SID {}, attempt {})", event_url, sid, attempt);

        let error = match transport.renew(event_url, sid, timeout).await {
            Ok(granted) => return Ok(granted),
            Err(error) => error,
        };

        let gone = matches!(error, TransportError::RejectedByRemote { status: 412, .. });
        if gone || attempt >= config.max_renewal_attempts {
            return Err(error.into());
        }

        let delay = config.retry_delay(attempt);
        if expires_at.is_some_and(|at| Instant::now() + delay >= at) {
            return Err(error.into());
        }

        tracing::warn!(
            "Renewal attempt {} for SID {} failed: {}, retrying in {:?}",
            attempt,
            sid,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Release a grant nobody is waiting for any more.
pub(crate) async fn release_orphan(transport: Arc<dyn EventTransport>, event_url: Url, sid: Sid) {
    tracing::debug!("Releasing orphaned subscription {} at {}", sid, event_url);
    if let Err(e) = transport.unsubscribe(&event_url, &sid).await {
        tracing::debug!("Failed to release orphaned subscription {}: {}", sid, e);
    }
}
