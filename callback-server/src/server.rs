//! HTTP server for receiving GENA NOTIFY requests.

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;
use warp::http::{HeaderMap, Method, StatusCode};
use warp::reply::WithStatus;
use warp::Filter;

use upnp_eventing::{NotifyError, NotifyRequest, NotifyStatus, Sid};

use crate::error::CallbackServerError;
use crate::handler::NotifyHandler;

/// HTTP callback server for GENA event notifications.
///
/// Binds to the first free port of a range and forwards every valid NOTIFY
/// request to its [`NotifyHandler`]. The server runs until
/// [`shutdown`](CallbackServer::shutdown) is called.
pub struct CallbackServer {
    port: u16,
    base_url: Url,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Start a server on the first free port in `port_range` (inclusive).
    ///
    /// The base URL advertised to devices uses the local address of the
    /// default route.
    pub async fn new(
        port_range: (u16, u16),
        handler: Arc<dyn NotifyHandler>,
    ) -> Result<Self, CallbackServerError> {
        let local_ip =
            Self::detect_local_ip().ok_or(CallbackServerError::LocalAddressUnavailable)?;
        Self::with_address(local_ip, port_range, handler).await
    }

    /// Start a server whose base URL advertises `advertised_ip`.
    ///
    /// The listener accepts connections on every interface of the same IP
    /// family.
    pub async fn with_address(
        advertised_ip: IpAddr,
        port_range: (u16, u16),
        handler: Arc<dyn NotifyHandler>,
    ) -> Result<Self, CallbackServerError> {
        let (start, end) = port_range;
        let unspecified = match advertised_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        for port in start..=end {
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let bound = warp::serve(routes(handler.clone())).try_bind_with_graceful_shutdown(
                SocketAddr::new(unspecified, port),
                async move {
                    let _ = shutdown_rx.await;
                },
            );

            let (addr, server) = match bound {
                Ok(bound) => bound,
                Err(e) => {
                    tracing::trace!("Port {} unavailable: {}", port, e);
                    continue;
                }
            };

            let base_url = Url::parse(&format!("http://{}/", SocketAddr::new(advertised_ip, addr.port())))
                .map_err(|e| CallbackServerError::InvalidBaseUrl(e.to_string()))?;

            tracing::info!("Callback server listening on {} ({})", addr, base_url);
            let server_handle = tokio::spawn(server);

            return Ok(Self {
                port: addr.port(),
                base_url,
                shutdown_tx: Some(shutdown_tx),
                server_handle: Some(server_handle),
            });
        }

        Err(CallbackServerError::NoAvailablePort { start, end })
    }

    /// Root URL to register as a callback root, e.g. `http://192.168.1.2:3400/`.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        tracing::info!("Callback server on port {} stopped", self.port);
    }

    /// Detect the local IP address for callback URLs.
    ///
    /// Connecting a UDP socket picks the interface of the default route
    /// without sending anything.
    fn detect_local_ip() -> Option<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }
}

fn routes(
    handler: Arc<dyn NotifyHandler>,
) -> impl Filter<Extract = (WithStatus<&'static str>,), Error = Infallible> + Clone {
    warp::method()
        .and(warp::path::full())
        .and(warp::header::headers_cloned())
        .and(warp::body::bytes())
        .and_then(
            move |method: Method, path: warp::path::FullPath, headers: HeaderMap, body: Bytes| {
                let handler = handler.clone();
                async move {
                    Ok::<_, warp::Rejection>(
                        handle_request(handler.as_ref(), method, path.as_str(), &headers, &body)
                            .await,
                    )
                }
            },
        )
        .recover(handle_rejection)
        .unify()
}

async fn handle_request(
    handler: &dyn NotifyHandler,
    method: Method,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> WithStatus<&'static str> {
    if method.as_str() != "NOTIFY" {
        return warp::reply::with_status("", StatusCode::METHOD_NOT_ALLOWED);
    }

    let (sid, request) = match parse_notify(headers, body) {
        Ok(parsed) => parsed,
        Err(e) => {
            let status = rejection_status(&e);
            tracing::warn!("Rejected NOTIFY to {} with {}: {}", path, status, e);
            return reply(status);
        }
    };

    tracing::debug!(
        "NOTIFY to {} for SID {} (SEQ {}, {} changes)",
        path,
        sid,
        request.seq,
        request.changes.len()
    );
    reply(handler.handle_notify(&sid, &request).await)
}

/// Validate a NOTIFY request's GENA headers and parse its body.
fn parse_notify(headers: &HeaderMap, body: &[u8]) -> Result<(Sid, NotifyRequest), NotifyError> {
    let nt = header(headers, "NT").ok_or(NotifyError::MissingHeader("NT"))?;
    let nts = header(headers, "NTS").ok_or(NotifyError::MissingHeader("NTS"))?;

    if nt != "upnp:event" {
        return Err(NotifyError::InvalidHeader {
            name: "NT",
            value: nt.to_string(),
        });
    }
    if nts != "upnp:propchange" {
        return Err(NotifyError::InvalidHeader {
            name: "NTS",
            value: nts.to_string(),
        });
    }

    let sid = header(headers, "SID").ok_or(NotifyError::MissingHeader("SID"))?;
    let seq = header(headers, "SEQ").ok_or(NotifyError::MissingHeader("SEQ"))?;

    let body = std::str::from_utf8(body).map_err(|e| NotifyError::InvalidBody(e.to_string()))?;
    let request = NotifyRequest::parse(seq, body)?;

    Ok((Sid::new(sid), request))
}

/// 412 for requests that cannot belong to a subscription, 400 for
/// malformed ones.
fn rejection_status(error: &NotifyError) -> NotifyStatus {
    match error {
        NotifyError::MissingHeader("SID") | NotifyError::InvalidHeader { .. } => {
            NotifyStatus::PreconditionFailed
        }
        _ => NotifyStatus::BadRequest,
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn reply(status: NotifyStatus) -> WithStatus<&'static str> {
    let code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    warp::reply::with_status("", code)
}

async fn handle_rejection(err: warp::Rejection) -> Result<WithStatus<&'static str>, Infallible> {
    let code = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        StatusCode::PAYLOAD_TOO_LARGE
    } else {
        tracing::debug!("Unhandled rejection: {:?}", err);
        StatusCode::BAD_REQUEST
    };

    Ok(warp::reply::with_status("", code))
}
