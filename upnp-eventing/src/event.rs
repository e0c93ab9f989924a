//! Observer events emitted by the subscription manager.

use crate::error::EventingError;
use crate::types::{ServiceKey, Sid, Timeout};

/// Lifecycle events, identified by the owning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// SUBSCRIBE succeeded.
    Subscribed {
        service: ServiceKey,
        sid: Sid,
        timeout: Timeout,
    },

    /// SUBSCRIBE failed, or could not be sent.
    SubscriptionFailed {
        service: ServiceKey,
        error: EventingError,
    },

    /// An UNSUBSCRIBE-backed cancel finished, whatever the remote answered.
    Unsubscribed { service: ServiceKey },

    /// RENEW succeeded.
    Renewed { service: ServiceKey, timeout: Timeout },

    /// Renewal failed after every retry; the subscription is gone.
    SubscriptionLost {
        service: ServiceKey,
        error: EventingError,
    },
}

impl SubscriptionEvent {
    /// The service this event is about.
    pub fn service(&self) -> &ServiceKey {
        match self {
            SubscriptionEvent::Subscribed { service, .. }
            | SubscriptionEvent::SubscriptionFailed { service, .. }
            | SubscriptionEvent::Unsubscribed { service }
            | SubscriptionEvent::Renewed { service, .. }
            | SubscriptionEvent::SubscriptionLost { service, .. } => service,
        }
    }

    /// Short name used in logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            SubscriptionEvent::Subscribed { .. } => "subscribed",
            SubscriptionEvent::SubscriptionFailed { .. } => "subscription_failed",
            SubscriptionEvent::Unsubscribed { .. } => "unsubscribed",
            SubscriptionEvent::Renewed { .. } => "renewed",
            SubscriptionEvent::SubscriptionLost { .. } => "subscription_lost",
        }
    }
}
