#![cfg_attr(docsrs, feature(doc_cfg))]

//! # ballista
//!
//! The `ballista` crate is an intercepting HTTP/HTTPS proxy that records the traffic it
//! relays.
//!
//! - Plain `http://` requests are forwarded to their origin and captured, request and
//!   response, into a [`capture::CaptureSink`].
//! - `CONNECT` tunnels are intercepted: the proxy mints a certificate for the requested
//!   host, terminates the client's TLS session and relays the decrypted requests to the real
//!   origin over its own TLS connection.
//! - Redirects are never followed on the proxy paths; a 3xx is handed back as is.
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! # async fn run() -> ballista::Result<()> {
//! let config = ballista::config::ProxyConfig::load(None)?;
//! let server = ballista::server::ProxyServer::from_config(&config).await?;
//! server.run(&config.listen_addr).await
//! # }
//! ```
//!
//! ## Certificates
//!
//! Every minted leaf is issued for one fixed host key, read once at startup. Leaves are signed
//! either by an external program, invoked as `<program> <host> <serial>` and expected to print
//! the certificate chain, or in process by [`mint::RcgenSigner`] from a CA certificate and key.
//! Clients have to trust the signing root for interception to succeed.
//!
//! ## Replay
//!
//! Captured requests can be loaded back with [`capture::CaptureSink::get_request`] and sent
//! again with a [`Client`]. [`scanner::Scanner`] probes wordlist paths on the origin of a
//! captured request.
//!
mod body;
/// Capture storage
pub mod capture;
mod client;
/// Configuration
pub mod config;
mod connector;
mod cookies;
mod errors;
/// Raw connection takeover
pub mod hijack;
/// Certificate minting
pub mod mint;
/// record info
pub mod record;
/// Redirect Handling
pub mod redirect;
/// Plain HTTP relay
pub mod relay;
mod request;
mod response;
/// Path discovery
pub mod scanner;
/// Proxy server
pub mod server;
mod socket;
mod tls;
/// TLS interception
pub mod tunnel;

pub use body::Body;
pub use client::{Client, ClientBuilder};
pub use connector::{Connector, ConnectorBuilder};
pub use cookies::Cookie;
pub use errors::{Error, Result};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use request::{Request, RequestReader};
pub use response::{ReasonPhrase, Response, ResponseBuilder, ResponseConfig};
pub use socket::{MaybeTlsStream, Socket};
pub use tls::{mitm_server_config, parse_certificate_chain, parse_private_key, Certificate};
pub use tokio_rustls::rustls;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
