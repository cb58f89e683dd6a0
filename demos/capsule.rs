//! A small capsule: a few routes, a subrouter and an input gate.
//!
//! Run with `cargo run --example capsule`, then fetch
//! `gemini://localhost/` with any Gemini client (the certificate is
//! generated on first start and pinned by TOFU clients from then on).

use std::io;
use std::path::Path;

use async_trait::async_trait;
use gemnet::cert::{self, Identity};
use gemnet::{Handler, Input, Request, ResponseWriter, ServeMux, Server};
use tokio_util::sync::CancellationToken;
use tracing::info;

struct Page(&'static str);

#[async_trait]
impl Handler for Page {
    async fn serve(&self, w: &mut dyn ResponseWriter, _r: &Request) -> io::Result<()> {
        w.write_all(self.0.as_bytes()).await
    }
}

struct Greet;

#[async_trait]
impl Handler for Greet {
    async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> io::Result<()> {
        let name = r.input().unwrap_or_else(|| "stranger".to_string());
        w.write_all(format!("# Hello, {name}!\n").as_bytes()).await
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let identity = load_or_create_identity("capsule.crt", "capsule.key");

    let mux = ServeMux::new();
    mux.handle("/", Page("# Demo capsule\n=> /docs/ Documentation\n=> /hello Say hello\n"));
    mux.handle("/hello", Input::new("What is your name?", Greet));
    mux.route("/docs/", |docs| {
        docs.handle("/", Page("# Documentation\n=> /intro Introduction\n"));
        docs.handle("/intro", Page("# Introduction\nNothing here yet.\n"));
    });

    let server = Server::builder()
        .address("127.0.0.1:1965")
        .handler(mux)
        .tls_config(cert::server_config(&identity).expect("tls config"))
        .build();

    info!("serving on gemini://localhost/");
    if let Err(e) = server.listen_and_serve(CancellationToken::new()).await {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
}

fn load_or_create_identity(cert_file: &str, key_file: &str) -> Identity {
    if Path::new(cert_file).exists() {
        Identity::load(cert_file, key_file).expect("load identity")
    } else {
        let identity = Identity::self_signed(&["localhost"], 365).expect("create identity");
        identity.store(cert_file, key_file).expect("store identity");
        identity
    }
}
