//! Minimal HTTP/1.1 POST client for the Slack Web API.
//!
//! Keeps a small pool of keep-alive connections, encodes form or multipart
//! bodies, and understands just enough of the response side (chunked
//! transfer, gzip) for api.slack.com.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed http response: {0}")]
    Protocol(String),

    #[error("invalid server name: {0}")]
    ServerName(String),

    #[error("unsupported url: {0}")]
    Url(String),
}

/// A form field: either a plain string or a file to upload.
pub enum Field {
    Text(String),
    File { filename: String, bytes: Vec<u8> },
}

pub struct HttpResponse {
    pub status: u16,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

trait AsyncStream: tokio::io::AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type Conn = BufStream<Box<dyn AsyncStream>>;

/// Pooled keep-alive client for one API host.
pub struct HttpClient {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    path_prefix: String,
    idle: Vec<Conn>,
}

impl HttpClient {
    /// `base_url` is e.g. `https://slack.com/api/`; requests are POSTed to
    /// `<path prefix><path>`.
    pub fn new(base_url: &str) -> Result<HttpClient, TransportError> {
        let (tls, rest) = if let Some(r) = base_url.strip_prefix("https://") {
            (true, r)
        } else if let Some(r) = base_url.strip_prefix("http://") {
            (false, r)
        } else {
            return Err(TransportError::Url(base_url.to_string()));
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse()
                    .map_err(|_| TransportError::Url(base_url.to_string()))?,
            ),
            None => (authority.to_string(), if tls { 443 } else { 80 }),
        };

        let connector = if tls {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            Some(TlsConnector::from(Arc::new(config)))
        } else {
            None
        };

        Ok(HttpClient {
            host,
            port,
            tls: connector,
            path_prefix: path.to_string(),
            idle: Vec::new(),
        })
    }

    async fn connect(&self) -> Result<Conn, TransportError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.host.clone())
                    .map_err(|_| TransportError::ServerName(self.host.clone()))?;
                let stream = connector.connect(name, tcp).await?;
                Ok(BufStream::new(Box::new(stream)))
            }
            None => Ok(BufStream::new(Box::new(tcp))),
        }
    }

    /// POST `fields` to `path`. A dead keep-alive connection is retried once
    /// on a fresh one; a failure on the fresh connection is final.
    pub async fn post(
        &mut self,
        path: &str,
        headers: &[(String, String)],
        fields: &[(String, Field)],
    ) -> Result<HttpResponse, TransportError> {
        let (content_type, body) = encode_fields(fields);

        let mut request = format!(
            "POST {}{} HTTP/1.1\r\nHost: {}\r\nConnection: keep-alive\r\nAccept-Encoding: gzip\r\n",
            self.path_prefix, path, self.host
        );
        for (k, v) in headers {
            request.push_str(&format!("{k}: {v}\r\n"));
        }
        request.push_str(&format!(
            "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
            content_type,
            body.len()
        ));

        let mut conn = match self.idle.pop() {
            Some(c) => c,
            None => self.connect().await?,
        };

        let response = match roundtrip(&mut conn, request.as_bytes(), &body).await {
            Ok(r) => r,
            Err(TransportError::Io(e)) => {
                debug!("connection died ({e}), retrying on a fresh one");
                let mut fresh = self.connect().await?;
                let r = roundtrip(&mut fresh, request.as_bytes(), &body).await?;
                conn = fresh;
                r
            }
            Err(e) => return Err(e),
        };

        self.idle.push(conn);
        Ok(response)
    }
}

async fn roundtrip(
    conn: &mut Conn,
    head: &[u8],
    body: &[u8],
) -> Result<HttpResponse, TransportError> {
    conn.write_all(head).await?;
    conn.write_all(body).await?;
    conn.flush().await?;
    read_response(conn).await
}

async fn read_response(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> Result<HttpResponse, TransportError> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before status line",
        )));
    }
    let status: u16 = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("bad status line: {line:?}")))?;

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(TransportError::Protocol("truncated headers".to_string()));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| TransportError::Protocol(format!("bad header line: {line:?}")))?;
        headers.insert(k.to_ascii_lowercase(), v.trim().to_string());
    }

    let mut body = Vec::new();
    if headers.get("transfer-encoding").map(String::as_str) == Some("chunked") {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).await?;
            if !size_line.ends_with("\r\n") {
                return Err(TransportError::Protocol(
                    "unexpected end of chunked data".to_string(),
                ));
            }
            let size = usize::from_str_radix(size_line.trim(), 16)
                .map_err(|_| TransportError::Protocol(format!("bad chunk size: {size_line:?}")))?;
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).await?;
            chunk.truncate(size);
            body.extend_from_slice(&chunk);
            if size == 0 {
                break;
            }
        }
    } else if let Some(len) = headers.get("content-length") {
        let len: usize = len
            .parse()
            .map_err(|_| TransportError::Protocol(format!("bad content-length: {len:?}")))?;
        body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
    } else {
        return Err(TransportError::Protocol(
            "response has neither content-length nor chunked encoding".to_string(),
        ));
    }

    if headers.get("content-encoding").map(String::as_str) == Some("gzip") {
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&body[..])
            .read_to_end(&mut decoded)
            .map_err(|e| TransportError::Protocol(format!("bad gzip body: {e}")))?;
        body = decoded;
    }

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// Pick the body encoding: url-encoded form when every field is text,
/// multipart otherwise.
fn encode_fields(fields: &[(String, Field)]) -> (String, Vec<u8>) {
    let all_text = fields.iter().all(|(_, v)| matches!(v, Field::Text(_)));
    if all_text {
        let encoded = fields
            .iter()
            .map(|(k, v)| {
                let Field::Text(v) = v else { unreachable!() };
                format!("{}={}", urlencode(k), urlencode(v))
            })
            .collect::<Vec<_>>()
            .join("&");
        return (
            "application/x-www-form-urlencoded".to_string(),
            encoded.into_bytes(),
        );
    }

    let boundary = Uuid::new_v4().to_string();
    let mut body = Vec::new();
    for (k, v) in fields {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match v {
            Field::File { filename, bytes } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{k}\"; filename=\"{filename}\"\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
            Field::Text(v) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{k}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(v.as_bytes());
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    (
        format!("multipart/form-data; boundary={boundary}"),
        body,
    )
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn text(s: &str) -> Field {
        Field::Text(s.to_string())
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("abc123"), "abc123");
        assert_eq!(urlencode("a b&c=d"), "a+b%26c%3Dd");
        assert_eq!(urlencode("ciao à"), "ciao+%C3%A0");
    }

    #[test]
    fn test_encode_fields_form() {
        let fields = vec![
            ("channel".to_string(), text("C123")),
            ("text".to_string(), text("hello world")),
        ];
        let (ct, body) = encode_fields(&fields);
        assert_eq!(ct, "application/x-www-form-urlencoded");
        assert_eq!(body, b"channel=C123&text=hello+world");
    }

    #[test]
    fn test_encode_fields_multipart() {
        let fields = vec![
            ("channels".to_string(), text("C123")),
            (
                "file".to_string(),
                Field::File {
                    filename: "x.txt".to_string(),
                    bytes: b"contents".to_vec(),
                },
            ),
        ];
        let (ct, body) = encode_fields(&fields);
        let boundary = ct
            .strip_prefix("multipart/form-data; boundary=")
            .expect("multipart content type");
        let body = String::from_utf8(body).unwrap();
        assert!(body.starts_with(&format!("--{boundary}\r\n")));
        assert!(body.contains("Content-Disposition: form-data; name=\"channels\"\r\n\r\nC123\r\n"));
        assert!(body.contains(
            "Content-Disposition: form-data; name=\"file\"; filename=\"x.txt\"\r\n\r\ncontents\r\n"
        ));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[tokio::test]
    async fn test_read_response_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"ok\":true}";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let r = read_response(&mut reader).await.unwrap();
        assert_eq!(r.status, 200);
        assert_eq!(
            r.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(r.body, b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_read_response_chunked() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let r = read_response(&mut reader).await.unwrap();
        assert_eq!(r.body, b"hello world");
    }

    #[tokio::test]
    async fn test_read_response_gzip() {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"compressed payload").unwrap();
        let gz = enc.finish().unwrap();

        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            gz.len()
        )
        .into_bytes();
        raw.extend_from_slice(&gz);

        let mut reader = tokio::io::BufReader::new(&raw[..]);
        let r = read_response(&mut reader).await.unwrap();
        assert_eq!(r.body, b"compressed payload");
    }

    #[tokio::test]
    async fn test_read_response_rejects_unknown_framing() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(&raw[..]);
        assert!(matches!(
            read_response(&mut reader).await,
            Err(TransportError::Protocol(_))
        ));
    }
}
