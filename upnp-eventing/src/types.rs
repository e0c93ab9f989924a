//! Core types for the upnp-eventing crate.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TransportError;

/// Unique device name (UDN) of a UPnP device, e.g. `uuid:5c8f...`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new device ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the device ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a service within the device tree.
///
/// A service ID (`urn:upnp-org:serviceId:...`) is only unique inside its
/// owning device, so the key pairs it with the device's UDN.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ServiceKey {
    /// The device that owns the service
    pub device_id: DeviceId,
    /// The service ID as advertised in the device description
    pub service_id: String,
}

impl ServiceKey {
    /// Create a new service key.
    pub fn new(device_id: impl Into<DeviceId>, service_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            service_id: service_id.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.service_id)
    }
}

/// GENA subscription identifier (`SID` header) granted by a remote service.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Sid(String);

impl Sid {
    /// Create a new SID from a string.
    pub fn new(sid: impl Into<String>) -> Self {
        Self(sid.into())
    }

    /// Get the SID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Sid {
    fn from(sid: &str) -> Self {
        Self(sid.to_string())
    }
}

impl From<String> for Sid {
    fn from(sid: String) -> Self {
        Self(sid)
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable local address of a subscription in the manager's arena.
///
/// Handles are allocated monotonically and never reused, so a late network
/// result can always be matched against the subscription that started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Create a handle with the given value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw handle value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Subscription duration as carried by the GENA `TIMEOUT` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    /// `Second-<n>`
    Seconds(u32),
    /// `Second-infinite`
    Infinite,
}

impl Timeout {
    /// The duration of a finite timeout, `None` for `Second-infinite`.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Timeout::Seconds(secs) => Some(Duration::from_secs(u64::from(*secs))),
            Timeout::Infinite => None,
        }
    }

    /// Build a finite timeout from a duration, saturating at `u32::MAX` seconds.
    pub fn from_duration(duration: Duration) -> Self {
        Timeout::Seconds(u32::try_from(duration.as_secs()).unwrap_or(u32::MAX))
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Seconds(1800)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Seconds(secs) => write!(f, "Second-{}", secs),
            Timeout::Infinite => write!(f, "Second-infinite"),
        }
    }
}

impl FromStr for Timeout {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        let rest = value
            .get(..7)
            .filter(|prefix| prefix.eq_ignore_ascii_case("Second-"))
            .map(|_| &value[7..])
            .ok_or_else(|| TransportError::Protocol(format!("invalid TIMEOUT header: {value}")))?;

        if rest.eq_ignore_ascii_case("infinite") {
            return Ok(Timeout::Infinite);
        }

        rest.parse::<u32>()
            .map(Timeout::Seconds)
            .map_err(|_| TransportError::Protocol(format!("invalid TIMEOUT header: {value}")))
    }
}

/// Which part of a device tree an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitMode {
    /// Only the services of the device itself
    ThisOnly,
    /// The device's services and, transitively, those of every embedded device
    Recursive,
}

/// Result of a single-service subscribe call.
///
/// `Success` only means an attempt was started; the outcome of the network
/// exchange is reported through [`crate::SubscriptionEvent`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Success,
    AlreadySubscribed,
    FailedNotEvented,
}

/// Externally visible state of a service's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    /// No subscription exists for the service
    Unsubscribed,
    Idle,
    Subscribing,
    Subscribed,
    Renewing,
    Unsubscribing,
    Cancelled,
    Failed,
}

impl SubscriptionStatus {
    /// Whether a subscription in this state counts as active for the service.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Idle
                | SubscriptionStatus::Subscribing
                | SubscriptionStatus::Subscribed
                | SubscriptionStatus::Renewing
                | SubscriptionStatus::Unsubscribing
        )
    }

    /// Whether a subscription in this state accepts NOTIFY requests.
    pub fn accepts_events(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Subscribed | SubscriptionStatus::Renewing
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionStatus::Unsubscribed => "unsubscribed",
            SubscriptionStatus::Idle => "idle",
            SubscriptionStatus::Subscribing => "subscribing",
            SubscriptionStatus::Subscribed => "subscribed",
            SubscriptionStatus::Renewing => "renewing",
            SubscriptionStatus::Unsubscribing => "unsubscribing",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}
