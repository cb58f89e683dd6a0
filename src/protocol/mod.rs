//! Core protocol types: requests, responses, status codes and URL
//! normalization.

pub mod status;

mod request;
mod response;
pub(crate) mod url;

pub use request::{Request, TlsInfo};
pub use response::{Body, Response};
pub use url::{absolute_url, clean_path, split_host_port};

/// MIME type of gemtext documents, the default meta for successful
/// responses.
pub const GEMTEXT_MIME_TYPE: &str = "text/gemini;charset=utf-8";
