//! Wire-level line codec for Gemini headers.
//!
//! Requests and responses both begin with a single header line terminated by
//! CRLF. The line is read one byte at a time so that no byte of a response
//! body is consumed ahead of the header.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest request line the server accepts: a 1024 byte URL plus CRLF.
pub const MAX_REQUEST_LINE: usize = 1026;

/// Longest response header the client accepts: two status digits, a space,
/// 1024 meta bytes and CRLF.
pub const MAX_RESPONSE_HEADER: usize = 1029;

/// Errors produced while reading a header line.
#[derive(Debug, Error)]
pub enum LineError {
    /// No CRLF within the permitted number of bytes.
    #[error("header line exceeds {max} bytes")]
    TooLong { max: usize },

    /// The header line is not valid UTF-8.
    #[error("header line is not valid utf-8")]
    NotUtf8,

    /// I/O error while reading.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Reads one header line of at most `max_len` bytes and returns the bytes
/// preceding the CRLF terminator.
pub async fn read_header_line<R>(r: &mut R, max_len: usize) -> Result<String, LineError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(64);

    for i in 0..max_len {
        buf.push(r.read_u8().await?);

        if i > 0 && buf[i - 1] == b'\r' && buf[i] == b'\n' {
            buf.truncate(i - 1);
            return String::from_utf8(buf).map_err(|_| LineError::NotUtf8);
        }
    }

    Err(LineError::TooLong { max: max_len })
}

/// Writes a `<code> <meta>` header line.
pub async fn reply<W>(w: &mut W, code: u8, meta: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(format!("{code} {meta}\r\n").as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_line(input: &str, max_len: usize) -> Result<String, LineError> {
        let mut reader = input.as_bytes();
        read_header_line(&mut reader, max_len).await
    }

    #[tokio::test]
    async fn reads_up_to_crlf() {
        assert_eq!(read_line("\r\n", 1029).await.unwrap(), "");
        assert_eq!(read_line("a.b.c\r\n", 1029).await.unwrap(), "a.b.c");
        assert_eq!(read_line("a\rb\r\nrest", 1029).await.unwrap(), "a\rb");
    }

    #[tokio::test]
    async fn empty_input_is_an_io_error() {
        match read_line("", 1029).await {
            Err(LineError::Io { source }) => {
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn enforces_the_length_bound() {
        // no newline at all
        let line = " ".repeat(1029);
        assert!(matches!(read_line(&line, 1029).await, Err(LineError::TooLong { max: 1029 })));

        // the terminator starts on the last permitted byte
        let line = format!("{}\r\n", " ".repeat(1028));
        assert!(matches!(read_line(&line, 1029).await, Err(LineError::TooLong { .. })));

        // the terminator just fits
        let line = format!("{}\r\n", " ".repeat(1027));
        assert_eq!(read_line(&line, 1029).await.unwrap(), " ".repeat(1027));
    }

    #[tokio::test]
    async fn leaves_trailing_bytes_unread() {
        let mut reader = "20 text/gemini\r\nbody bytes".as_bytes();
        let line = read_header_line(&mut reader, MAX_RESPONSE_HEADER).await.unwrap();
        assert_eq!(line, "20 text/gemini");
        assert_eq!(reader, b"body bytes");
    }

    #[tokio::test]
    async fn reply_formats_the_header_line() {
        let mut out = Vec::new();
        reply(&mut out, 51, "Not Found").await.unwrap();
        assert_eq!(out, b"51 Not Found\r\n");
    }
}
