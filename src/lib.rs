//! Client and server implementations for the Gemini protocol.
//!
//! Gemini is a minimalist application-layer protocol: mandatory TLS, a
//! single URL line per request and a two-digit status header per response.
//! This crate provides a concurrent [`Server`] with pluggable [`Handler`]s,
//! a [`Client`] with redirect following and optional client certificates, a
//! Trust-On-First-Use host store ([`HostsFile`]) and a pattern based
//! request router ([`ServeMux`]).
//!
//! ```no_run
//! use std::io;
//!
//! use async_trait::async_trait;
//! use gemnet::{Handler, Request, ResponseWriter, ServeMux, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Home;
//!
//! #[async_trait]
//! impl Handler for Home {
//!     async fn serve(&self, w: &mut dyn ResponseWriter, _r: &Request) -> io::Result<()> {
//!         w.write_all(b"# Welcome\n").await
//!     }
//! }
//!
//! # async fn run(tls_config: std::sync::Arc<tokio_rustls::rustls::ServerConfig>) {
//! let mux = ServeMux::new();
//! mux.handle("/", Home);
//!
//! let server = Server::builder().handler(mux).tls_config(tls_config).build();
//! server.listen_and_serve(CancellationToken::new()).await.unwrap();
//! # }
//! ```

pub mod cert;
pub mod client;
pub mod codec;
pub mod connection;
pub mod handler;
pub mod mux;
pub mod protocol;
pub mod server;
pub mod testing;
pub mod tofu;

pub use client::{
    single_client_certificate, Client, ClientBuilder, ClientError, ClientIdentity, GetCertificate,
    MAX_REDIRECTS,
};
pub use handler::{
    not_found, redirect, Handler, Input, NotFoundHandler, RedirectHandler, ResponseWriter,
    StripPrefix,
};
pub use mux::ServeMux;
pub use protocol::{
    absolute_url, clean_path, split_host_port, status, Body, Request, Response, TlsInfo,
    GEMTEXT_MIME_TYPE,
};
pub use server::{Server, ServerBuilder, ServerError};
pub use tofu::{HostEntry, HostsFile, TrustError};
