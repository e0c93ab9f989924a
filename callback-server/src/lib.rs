//! HTTP callback server for GENA event notifications.
//!
//! The server binds to the first free port in a range and accepts `NOTIFY`
//! requests on any path. Each request's `NT`, `NTS`, `SID` and `SEQ` headers
//! and `e:propertyset` body are validated before it is handed to a
//! [`NotifyHandler`], usually an `upnp_eventing::SubscriptionManager`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use callback_server::CallbackServer;
//! use gena_client::GenaClient;
//! use upnp_eventing::{EventingConfig, SubscriptionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Arc::new(GenaClient::new()?);
//!     let manager = Arc::new(SubscriptionManager::new(client.clone(), EventingConfig::default())?);
//!
//!     let server = CallbackServer::new((3400, 3500), manager.clone()).await?;
//!     client.add_callback_root(server.base_url().clone());
//!
//!     // subscribe through `manager` ...
//!
//!     manager.shutdown().await;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Response codes:
//!
//! | condition                                   | status |
//! |---------------------------------------------|--------|
//! | missing `NT`, `NTS` or `SEQ`, malformed body | 400    |
//! | wrong `NT`/`NTS`, missing `SID`             | 412    |
//! | rejected by the handler                     | 412    |
//! | accepted                                    | 200    |
//! | any method other than `NOTIFY`              | 405    |

mod error;
mod handler;
mod server;

pub use error::CallbackServerError;
pub use handler::NotifyHandler;
pub use server::CallbackServer;
