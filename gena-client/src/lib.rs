//! HTTP transport for UPnP event subscriptions
//!
//! [`GenaClient`] sends the GENA SUBSCRIBE, RENEW and UNSUBSCRIBE requests
//! on behalf of an `upnp_eventing::SubscriptionManager`, and keeps the list
//! of local callback server roots that devices should send NOTIFY requests
//! to.
//!
//! ```rust,ignore
//! let client = Arc::new(GenaClient::new()?);
//! client.add_callback_root(callback_server.base_url());
//!
//! let manager = SubscriptionManager::new(client.clone(), EventingConfig::default())?;
//! ```

mod error;

pub use error::GenaError;

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response};
use url::Url;

use upnp_eventing::{
    select_callback_root, EventTransport, Sid, SubscribeGrant, Timeout, TransportError,
};

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct GenaClientConfig {
    /// Time allowed to establish a connection
    pub connect_timeout: Duration,
    /// Time allowed for a whole request, response included
    pub request_timeout: Duration,
    /// `User-Agent` header sent with every request
    pub user_agent: String,
}

impl Default for GenaClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            user_agent: format!(
                "upnp-eventing/{} UPnP/1.1",
                env!("CARGO_PKG_VERSION")
            ),
        }
    }
}

/// GENA client over `reqwest`
#[derive(Debug)]
pub struct GenaClient {
    http: reqwest::Client,
    roots: RwLock<Vec<Url>>,
}

impl GenaClient {
    /// Create a client with default configuration
    pub fn new() -> Result<Self, GenaError> {
        Self::with_config(GenaClientConfig::default())
    }

    pub fn with_config(config: GenaClientConfig) -> Result<Self, GenaError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent)
            .build()?;

        Ok(Self {
            http,
            roots: RwLock::new(Vec::new()),
        })
    }

    /// Register a local HTTP server root that can receive NOTIFY requests.
    ///
    /// Roots are kept in registration order; registering the same root twice
    /// has no effect.
    pub fn add_callback_root(&self, root: Url) {
        let mut roots = self.roots.write();
        if !roots.contains(&root) {
            tracing::debug!("Registered callback root {}", root);
            roots.push(root);
        }
    }

    /// Forget a callback root. Returns true if it was registered.
    pub fn remove_callback_root(&self, root: &Url) -> bool {
        let mut roots = self.roots.write();
        let before = roots.len();
        roots.retain(|r| r != root);
        roots.len() != before
    }

    pub fn callback_roots(&self) -> Vec<Url> {
        self.roots.read().clone()
    }

    /// Send an initial SUBSCRIBE.
    pub async fn send_subscribe(
        &self,
        event_url: &Url,
        callback_url: &Url,
        timeout: Timeout,
    ) -> Result<SubscribeGrant, GenaError> {
        let response = self
            .http
            .request(gena_method("SUBSCRIBE")?, event_url.clone())
            .header("CALLBACK", format!("<{}>", callback_url))
            .header("NT", "upnp:event")
            .header("TIMEOUT", timeout.to_string())
            .send()
            .await?;
        let response = check_status("SUBSCRIBE", response)?;

        let sid = header_str(response.headers(), "SID")
            .ok_or(GenaError::MissingHeader("SID"))?;
        let granted = granted_timeout(response.headers(), timeout)?;

        Ok(SubscribeGrant {
            sid: Sid::new(sid),
            timeout: granted,
        })
    }

    /// Send a RENEW: SUBSCRIBE with `SID` and `TIMEOUT` but no `CALLBACK`
    /// or `NT`.
    pub async fn send_renew(
        &self,
        event_url: &Url,
        sid: &Sid,
        timeout: Timeout,
    ) -> Result<Timeout, GenaError> {
        let response = self
            .http
            .request(gena_method("SUBSCRIBE")?, event_url.clone())
            .header("SID", sid.as_str())
            .header("TIMEOUT", timeout.to_string())
            .send()
            .await?;
        let response = check_status("RENEW", response)?;

        granted_timeout(response.headers(), timeout)
    }

    /// Send an UNSUBSCRIBE.
    pub async fn send_unsubscribe(&self, event_url: &Url, sid: &Sid) -> Result<(), GenaError> {
        let response = self
            .http
            .request(gena_method("UNSUBSCRIBE")?, event_url.clone())
            .header("SID", sid.as_str())
            .send()
            .await?;
        check_status("UNSUBSCRIBE", response)?;
        Ok(())
    }
}

#[async_trait]
impl EventTransport for GenaClient {
    async fn subscribe(
        &self,
        event_url: &Url,
        callback_url: &Url,
        timeout: Timeout,
    ) -> Result<SubscribeGrant, TransportError> {
        Ok(self.send_subscribe(event_url, callback_url, timeout).await?)
    }

    async fn renew(
        &self,
        event_url: &Url,
        sid: &Sid,
        timeout: Timeout,
    ) -> Result<Timeout, TransportError> {
        Ok(self.send_renew(event_url, sid, timeout).await?)
    }

    async fn unsubscribe(&self, event_url: &Url, sid: &Sid) -> Result<(), TransportError> {
        Ok(self.send_unsubscribe(event_url, sid).await?)
    }

    fn callback_root(&self, device_locations: &[Url]) -> Option<Url> {
        select_callback_root(&self.roots.read(), device_locations)
    }
}

fn gena_method(name: &'static str) -> Result<Method, GenaError> {
    Method::from_bytes(name.as_bytes()).map_err(|e| GenaError::Client(e.to_string()))
}

fn check_status(method: &'static str, response: Response) -> Result<Response, GenaError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    tracing::debug!("{} to {} returned {}", method, response.url(), status);
    Err(GenaError::Status {
        method,
        status: status.as_u16(),
        reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// The `TIMEOUT` a device granted. Devices that omit the header are taken to
/// have granted what was asked for.
fn granted_timeout(headers: &HeaderMap, requested: Timeout) -> Result<Timeout, GenaError> {
    match header_str(headers, "TIMEOUT") {
        Some(value) => value.parse().map_err(|_| GenaError::InvalidHeader {
            name: "TIMEOUT",
            value: value.to_string(),
        }),
        None => Ok(requested),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_callback_roots_deduplicated() {
        let client = GenaClient::new().unwrap();
        client.add_callback_root(url("http://192.168.1.2:3400/"));
        client.add_callback_root(url("http://10.0.0.2:3400/"));
        client.add_callback_root(url("http://192.168.1.2:3400/"));

        assert_eq!(client.callback_roots().len(), 2);
        assert!(client.remove_callback_root(&url("http://10.0.0.2:3400/")));
        assert!(!client.remove_callback_root(&url("http://10.0.0.2:3400/")));
        assert_eq!(client.callback_roots(), vec![url("http://192.168.1.2:3400/")]);
    }

    #[test]
    fn test_callback_root_follows_device_subnet() {
        let client = GenaClient::new().unwrap();
        assert!(client.callback_root(&[url("http://192.168.1.10:1400/")]).is_none());

        client.add_callback_root(url("http://10.0.0.2:3400/"));
        client.add_callback_root(url("http://192.168.1.2:3400/"));

        let root = client
            .callback_root(&[url("http://192.168.1.10:1400/xml/device_description.xml")])
            .unwrap();
        assert_eq!(root.host_str(), Some("192.168.1.2"));
    }

    #[test]
    fn test_granted_timeout() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            granted_timeout(&headers, Timeout::Seconds(600)).unwrap(),
            Timeout::Seconds(600)
        );

        headers.insert("timeout", HeaderValue::from_static("Second-300"));
        assert_eq!(
            granted_timeout(&headers, Timeout::Seconds(600)).unwrap(),
            Timeout::Seconds(300)
        );

        headers.insert("timeout", HeaderValue::from_static("second-infinite"));
        assert_eq!(
            granted_timeout(&headers, Timeout::Seconds(600)).unwrap(),
            Timeout::Infinite
        );

        headers.insert("timeout", HeaderValue::from_static("300"));
        assert!(matches!(
            granted_timeout(&headers, Timeout::Seconds(600)),
            Err(GenaError::InvalidHeader { name: "TIMEOUT", .. })
        ));
    }
}
