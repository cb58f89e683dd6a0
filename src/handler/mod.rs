//! Request handlers and the response writer they target.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::Request;

mod combinators;

pub use combinators::{not_found, redirect, Input, NotFoundHandler, RedirectHandler, StripPrefix};

/// Constructs the response to a request.
///
/// [`write_header`](ResponseWriter::write_header) only records the status
/// line; it is serialized at the first body write, so handlers may revise it
/// until they start streaming. A status below 10 suppresses the header
/// entirely, letting CGI style handlers emit the wire format themselves.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Sets the response status and meta.
    fn write_header(&mut self, status: u8, meta: &str);

    /// Writes body bytes, emitting the recorded header first if necessary.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Writes the whole buffer.
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut rest = buf;
        while !rest.is_empty() {
            let n = self.write(rest).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            rest = &rest[n..];
        }
        Ok(())
    }
}

/// Responds to a Gemini request.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> io::Result<()>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> io::Result<()> {
        (**self).serve(w, r).await
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Box<H> {
    async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> io::Result<()> {
        (**self).serve(w, r).await
    }
}
