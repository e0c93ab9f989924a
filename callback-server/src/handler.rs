//! The seam between the HTTP server and whatever consumes notifications.

use async_trait::async_trait;
use upnp_eventing::{NotifyRequest, NotifyStatus, Sid, SubscriptionManager};

/// Receives validated NOTIFY requests.
///
/// The returned status is sent back to the device as the HTTP response.
#[async_trait]
pub trait NotifyHandler: Send + Sync + 'static {
    async fn handle_notify(&self, sid: &Sid, request: &NotifyRequest) -> NotifyStatus;
}

#[async_trait]
impl NotifyHandler for SubscriptionManager {
    async fn handle_notify(&self, sid: &Sid, request: &NotifyRequest) -> NotifyStatus {
        self.on_notify(sid, request).await
    }
}
