//! Fetches a Gemini URL and prints the response, pinning host keys in a
//! local hostsfile.
//!
//! Run with `cargo run --example fetch -- gemini://geminiprotocol.net/`.

use std::sync::Arc;

use gemnet::tofu::HostsFile;
use gemnet::Client;
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let url = match std::env::args().nth(1) {
        Some(url) => url,
        None => {
            eprintln!("usage: fetch <gemini-url>");
            std::process::exit(1);
        }
    };

    let hosts = match HostsFile::open("known_hosts") {
        Ok(hosts) => Arc::new(hosts),
        Err(e) => {
            eprintln!("cannot open hostsfile: {e}");
            std::process::exit(1);
        }
    };

    let client = Client::builder().hosts_file(hosts).build();

    let mut res = match client.get(&url).await {
        Ok(res) => res,
        Err(e) => {
            eprintln!("request failed: {e}");
            std::process::exit(1);
        }
    };

    eprintln!("{} {} ({})", res.status, res.meta, res.url);

    let mut body = String::new();
    match res.body.read_to_string(&mut body).await {
        Ok(_) => print!("{body}"),
        Err(e) => {
            eprintln!("read body: {e}");
            std::process::exit(1);
        }
    }
}
