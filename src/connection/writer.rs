//! Deferred-header response writer.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::codec;
use crate::handler::ResponseWriter;
use crate::protocol::{status, GEMTEXT_MIME_TYPE};

/// [`ResponseWriter`] that defers the header line until the first body
/// write, so handlers may overwrite the status and meta until they begin
/// streaming. A status below 10 at emission time suppresses the header
/// entirely and the handler owns the wire format.
pub struct DeferredWriter<'a> {
    w: &'a mut (dyn AsyncWrite + Send + Unpin),
    status: u8,
    meta: String,
    wrote_header: bool,
}

impl<'a> DeferredWriter<'a> {
    /// Creates a writer in the default state: 20 with the gemtext MIME type.
    pub fn new(w: &'a mut (dyn AsyncWrite + Send + Unpin)) -> DeferredWriter<'a> {
        DeferredWriter {
            w,
            status: status::OK,
            meta: GEMTEXT_MIME_TYPE.to_string(),
            wrote_header: false,
        }
    }

    /// The currently recorded status.
    pub fn status(&self) -> u8 {
        self.status
    }

    /// The currently recorded meta.
    pub fn meta(&self) -> &str {
        &self.meta
    }

    /// Emits the recorded header if it has not been written yet.
    pub async fn flush_header(&mut self) -> io::Result<()> {
        if !self.wrote_header {
            self.wrote_header = true;
            if self.status >= 10 {
                codec::reply(self.w, self.status, &self.meta).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ResponseWriter for DeferredWriter<'_> {
    fn write_header(&mut self, status: u8, meta: &str) {
        self.status = status;
        self.meta = meta.to_string();
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flush_header().await?;
        self.w.write(buf).await
    }
}

#[cfg(test)]
mod tests {
    use crate::handler::ResponseWriter as _;

    use super::*;

    #[tokio::test]
    async fn emits_the_default_header_at_first_write() {
        let mut out = Vec::new();
        let mut w = DeferredWriter::new(&mut out);
        w.write_all(b"hello world").await.unwrap();
        assert_eq!(out, b"20 text/gemini;charset=utf-8\r\nhello world");
    }

    #[tokio::test]
    async fn the_last_header_before_streaming_wins() {
        let mut out = Vec::new();
        let mut w = DeferredWriter::new(&mut out);
        w.write_header(status::TEMPORARY_FAILURE, "try later");
        w.write_header(status::NOT_FOUND, "Not Found");
        w.flush_header().await.unwrap();
        assert_eq!(out, b"51 Not Found\r\n");
    }

    #[tokio::test]
    async fn headers_after_the_first_write_are_ignored() {
        let mut out = Vec::new();
        let mut w = DeferredWriter::new(&mut out);
        w.write_all(b"body").await.unwrap();
        w.write_header(status::NOT_FOUND, "Not Found");
        w.flush_header().await.unwrap();
        assert_eq!(out, b"20 text/gemini;charset=utf-8\r\nbody");
    }

    #[tokio::test]
    async fn sub_ten_status_suppresses_the_header() {
        let mut out = Vec::new();
        let mut w = DeferredWriter::new(&mut out);
        w.write_header(0, "");
        w.write_all(b"42 raw cgi output\r\n").await.unwrap();
        assert_eq!(out, b"42 raw cgi output\r\n");
    }
}
