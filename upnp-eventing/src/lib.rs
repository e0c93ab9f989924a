//! # upnp-eventing
//!
//! GENA event subscriptions for a UPnP control point.
//!
//! The [`SubscriptionManager`] subscribes to single services or whole device
//! trees, renews subscriptions before they lapse, cancels them individually
//! or in bulk, and routes incoming NOTIFY requests to the service that owns
//! the subscription.
//!
//! The manager never touches the network directly. Outbound requests go
//! through an [`EventTransport`] (see the `gena-client` crate for an HTTP
//! implementation) and inbound NOTIFY requests are handed to
//! [`SubscriptionManager::on_notify`] by an HTTP server (see the
//! `callback-server` crate). The device/service tree is consumed through the
//! [`DeviceProxy`] and [`ServiceProxy`] traits.
//!
//! Subscription outcomes are reported asynchronously as
//! [`SubscriptionEvent`]s on the stream returned by
//! [`SubscriptionManager::event_stream`].

mod config;
mod error;
mod event;
mod index;
mod manager;
mod model;
mod notify;
mod subscription;
mod transport;
mod types;

pub mod logging;

pub use config::EventingConfig;
pub use error::{EventingError, NotifyError, Result, TransportError};
pub use event::SubscriptionEvent;
pub use manager::SubscriptionManager;
pub use model::{collect_device_ids, collect_services, DeviceProxy, ServiceProxy};
pub use notify::{
    next_seq, parse_property_set, parse_seq, NotifyRequest, NotifyStatus, StateVariableChange,
};
pub use subscription::{Exchange, Subscription, MIN_RENEWAL_INTERVAL};
pub use transport::{select_callback_root, EventTransport, SubscribeGrant};
pub use types::{
    DeviceId, ServiceKey, Sid, SubscribeOutcome, SubscriptionHandle, SubscriptionStatus, Timeout,
    VisitMode,
};
