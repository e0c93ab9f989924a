//! Outbound GENA transport interface.

use std::net::IpAddr;

use async_trait::async_trait;
use url::{Host, Url};

use crate::error::TransportError;
use crate::types::{Sid, Timeout};

/// What a remote service granted in response to SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeGrant {
    pub sid: Sid,
    pub timeout: Timeout,
}

/// Sends SUBSCRIBE, RENEW and UNSUBSCRIBE requests on behalf of the manager.
///
/// Implementations are shared between tasks, so they must be `Send + Sync`.
/// Each call is expected to finish or fail on its own schedule; the manager
/// never cancels an exchange mid-flight.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Initial SUBSCRIBE with `CALLBACK`, `NT` and `TIMEOUT` headers.
    async fn subscribe(
        &self,
        event_url: &Url,
        callback_url: &Url,
        timeout: Timeout,
    ) -> Result<SubscribeGrant, TransportError>;

    /// RENEW (SUBSCRIBE with `SID` and `TIMEOUT`), returning the granted timeout.
    async fn renew(&self, event_url: &Url, sid: &Sid, timeout: Timeout)
        -> Result<Timeout, TransportError>;

    /// UNSUBSCRIBE with `SID` only.
    async fn unsubscribe(&self, event_url: &Url, sid: &Sid) -> Result<(), TransportError>;

    /// The local HTTP server root best suited to receive NOTIFY requests from
    /// a device found at `device_locations`. `None` if no server is running.
    fn callback_root(&self, device_locations: &[Url]) -> Option<Url>;
}

/// Pick the callback root that shares the longest address prefix with one
/// of the device locations.
///
/// Only roots of the same IP family as a device address are compared. When
/// no root matches, or the locations carry no IP address, the first root is
/// used.
pub fn select_callback_root(roots: &[Url], device_locations: &[Url]) -> Option<Url> {
    let device_ips: Vec<IpAddr> = device_locations.iter().filter_map(host_ip).collect();

    let best = roots
        .iter()
        .filter_map(|root| {
            let root_ip = host_ip(root)?;
            device_ips
                .iter()
                .filter_map(|device_ip| common_prefix_len(&root_ip, device_ip))
                .max()
                .map(|score| (score, root))
        })
        // max_by_key keeps the last maximum; reverse so ties go to the earlier root
        .rev()
        .max_by_key(|(score, _)| *score)
        .map(|(_, root)| root);

    best.or_else(|| roots.first()).cloned()
}

fn host_ip(url: &Url) -> Option<IpAddr> {
    match url.host()? {
        Host::Ipv4(ip) => Some(IpAddr::V4(ip)),
        Host::Ipv6(ip) => Some(IpAddr::V6(ip)),
        Host::Domain(_) => None,
    }
}

fn common_prefix_len(a: &IpAddr, b: &IpAddr) -> Option<u32> {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => Some((u32::from(*a) ^ u32::from(*b)).leading_zeros()),
        (IpAddr::V6(a), IpAddr::V6(b)) => Some((u128::from(*a) ^ u128::from(*b)).leading_zeros()),
        _ => None,
    }
}
