//! TLS ClientHello sniffing
//!
//! Reads exactly the TLS records that carry the first handshake message,
//! extracts the `server_name` extension and hands back every byte consumed so
//! the caller can replay them to the backend. Nothing is decrypted and no
//! handshake state is kept.
//!
//! ```text
//! record:     type(1)=0x16 version(2) length(2) fragment
//! handshake:  type(1)=0x01 length(3) body
//! body:       version(2) random(32) session_id(1+n) cipher_suites(2+n)
//!             compression_methods(1+n) extensions(2+n)
//! extension:  type(2) length(2) data          server_name is type 0x0000
//! server_name: list_length(2) { name_type(1)=0x00 name_length(2) name }
//! ```

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use thiserror::Error;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Largest plaintext record fragment allowed by TLS
const MAX_RECORD_LEN: usize = 1 << 14;
/// Upper bound for a ClientHello spread across several records
const MAX_CLIENT_HELLO_LEN: usize = 1 << 16;

#[derive(Debug, Error)]
pub enum SniError {
    #[error("i/o error while reading client hello: {0}")]
    Io(#[from] io::Error),

    #[error("not a TLS handshake record (content type {0:#04x})")]
    NotHandshake(u8),

    #[error("first handshake message is not a ClientHello (type {0:#04x})")]
    NotClientHello(u8),

    #[error("invalid record length {0}")]
    RecordLength(usize),

    #[error("client hello of {0} bytes is too large")]
    TooLarge(usize),

    #[error("malformed client hello: {0}")]
    Malformed(&'static str),
}

/// The parsed part of a ClientHello and the raw bytes it arrived in
#[derive(Debug, Clone)]
pub struct ClientHello {
    /// `None` when the client sent no SNI extension
    pub server_name: Option<String>,
    /// Every byte read from the connection, to be replayed upstream
    pub consumed: Bytes,
}

/// Read records from `reader` until one complete ClientHello is buffered.
pub async fn read_client_hello<R>(reader: &mut R) -> Result<ClientHello, SniError>
where
    R: AsyncRead + Unpin,
{
    let mut consumed = BytesMut::with_capacity(512);
    let mut handshake = Vec::new();

    loop {
        let mut header = [0u8; RECORD_HEADER_LEN];
        reader.read_exact(&mut header).await?;
        consumed.extend_from_slice(&header);

        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(SniError::NotHandshake(header[0]));
        }
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if len == 0 || len > MAX_RECORD_LEN {
            return Err(SniError::RecordLength(len));
        }

        let start = consumed.len();
        consumed.resize(start + len, 0);
        reader.read_exact(&mut consumed[start..]).await?;
        handshake.extend_from_slice(&consumed[start..]);

        if handshake.len() < HANDSHAKE_HEADER_LEN {
            continue;
        }
        if handshake[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
            return Err(SniError::NotClientHello(handshake[0]));
        }
        let body_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
        if body_len > MAX_CLIENT_HELLO_LEN {
            return Err(SniError::TooLarge(body_len));
        }
        let end = HANDSHAKE_HEADER_LEN + body_len;
        if handshake.len() >= end {
            let server_name = parse_server_name(&handshake[HANDSHAKE_HEADER_LEN..end])?;
            return Ok(ClientHello {
                server_name,
                consumed: consumed.freeze(),
            });
        }
    }
}

/// Extract the host name from a ClientHello body (without handshake header).
pub fn parse_server_name(body: &[u8]) -> Result<Option<String>, SniError> {
    let mut r = Reader::new(body);
    r.skip(2 + 32)?;
    let session_id = r.u8()? as usize;
    r.skip(session_id)?;
    let cipher_suites = r.u16()? as usize;
    r.skip(cipher_suites)?;
    let compression = r.u8()? as usize;
    r.skip(compression)?;

    if r.is_empty() {
        return Ok(None);
    }
    let extensions_len = r.u16()? as usize;
    let mut extensions = Reader::new(r.take(extensions_len)?);

    while !extensions.is_empty() {
        let kind = extensions.u16()?;
        let len = extensions.u16()? as usize;
        let data = extensions.take(len)?;
        if kind != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut ext = Reader::new(data);
        let list_len = ext.u16()? as usize;
        let mut list = Reader::new(ext.take(list_len)?);
        while !list.is_empty() {
            let name_type = list.u8()?;
            let name_len = list.u16()? as usize;
            let name = list.take(name_len)?;
            if name_type == NAME_TYPE_HOST_NAME {
                let name = std::str::from_utf8(name)
                    .map_err(|_| SniError::Malformed("server name is not UTF-8"))?;
                return Ok(Some(name.to_string()));
            }
        }
        return Ok(None);
    }
    Ok(None)
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        if self.buf.len() < n {
            return Err(SniError::Malformed("truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), SniError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn with_u16_len(data: &[u8]) -> Vec<u8> {
        let mut out = (data.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(data);
        out
    }

    /// Handshake message (header + body) of a minimal ClientHello.
    pub(crate) fn client_hello_message(server_name: Option<&str>) -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0x42; 32]);
        body.push(0);
        body.extend(with_u16_len(&[0x13, 0x01, 0x00, 0x2f]));
        body.extend_from_slice(&[1, 0]);

        let mut extensions = Vec::new();
        // supported_versions, to have something before server_name
        extensions.extend_from_slice(&[0x00, 0x2b]);
        extensions.extend(with_u16_len(&[0x02, 0x03, 0x04]));
        if let Some(name) = server_name {
            let mut entry = vec![NAME_TYPE_HOST_NAME];
            entry.extend(with_u16_len(name.as_bytes()));
            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend(with_u16_len(&with_u16_len(&entry)));
        }
        body.extend(with_u16_len(&extensions));

        let mut message = vec![HANDSHAKE_TYPE_CLIENT_HELLO];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.extend(body);
        message
    }

    fn record(fragment: &[u8]) -> Vec<u8> {
        let mut out = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        out.extend(with_u16_len(fragment));
        out
    }

    #[tokio::test]
    async fn test_reads_server_name_and_stops_at_message_end() {
        let hello = record(&client_hello_message(Some("secure.site.test")));
        let mut input = hello.clone();
        input.extend_from_slice(b"application data");

        let mut reader = &input[..];
        let parsed = read_client_hello(&mut reader).await.unwrap();

        assert_eq!(parsed.server_name.as_deref(), Some("secure.site.test"));
        assert_eq!(&parsed.consumed[..], &hello[..]);
        assert_eq!(reader, b"application data");
    }

    #[tokio::test]
    async fn test_client_hello_split_across_records() {
        let message = client_hello_message(Some("a.site.test"));
        let (first, second) = message.split_at(3);
        let mut input = record(first);
        input.extend(record(second));

        let mut reader = &input[..];
        let parsed = read_client_hello(&mut reader).await.unwrap();

        assert_eq!(parsed.server_name.as_deref(), Some("a.site.test"));
        assert_eq!(&parsed.consumed[..], &input[..]);
    }

    #[tokio::test]
    async fn test_no_server_name() {
        let input = record(&client_hello_message(None));
        let parsed = read_client_hello(&mut &input[..]).await.unwrap();
        assert_eq!(parsed.server_name, None);
    }

    #[tokio::test]
    async fn test_plain_http_rejected() {
        let input = b"GET / HTTP/1.1\r\nHost: a.site.test\r\n\r\n".to_vec();
        let err = read_client_hello(&mut &input[..]).await.unwrap_err();
        assert!(matches!(err, SniError::NotHandshake(b'G')));
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let input = record(&client_hello_message(Some("a.site.test")));
        let err = read_client_hello(&mut &input[..20]).await.unwrap_err();
        assert!(matches!(err, SniError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_other_handshake_message_rejected() {
        let mut message = client_hello_message(Some("a.site.test"));
        message[0] = 0x02;
        let input = record(&message);
        let err = read_client_hello(&mut &input[..]).await.unwrap_err();
        assert!(matches!(err, SniError::NotClientHello(0x02)));
    }

    #[test]
    fn test_malformed_extension_length() {
        let message = client_hello_message(Some("a.site.test"));
        let mut body = message[HANDSHAKE_HEADER_LEN..].to_vec();
        let len = body.len();
        body.truncate(len - 3);
        assert!(matches!(
            parse_server_name(&body),
            Err(SniError::Malformed("truncated"))
        ));
    }
}
