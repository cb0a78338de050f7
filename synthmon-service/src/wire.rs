//! Minimal HTTP/1.1 client over raw TCP and TLS with per-phase timing
//! capture.
//!
//! High-level clients hide connection establishment behind pooling, which is
//! exactly the part the raw executor needs to observe. Every exchange here
//! opens a fresh connection, so dns, connect, and tls phases are measurable
//! on each run. The response body is drained and counted, never buffered.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH};
use http::{Method, Request};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::WireError;
use crate::trace::TimingTracer;

const READ_CHUNK: usize = 8 * 1024;

trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

/// The outcome of one exchange. The body has been drained; only its length
/// is retained.
#[derive(Debug)]
pub struct WireResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    pub body_bytes: u64,
}

impl WireResponse {
    /// First header value for `name` (ASCII case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Connection-per-request HTTP/1.1 client.
#[derive(Clone)]
pub struct WireClient {
    tls: TlsConnector,
}

impl WireClient {
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        // Pin the crypto provider instead of relying on a process-wide
        // default being installed.
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("ring provider supports the default protocol versions")
            .with_root_certificates(roots)
            .with_no_client_auth();
        WireClient {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Performs one exchange, marking connection phases on `tracer` as they
    /// happen. Returns once the response body has been fully drained.
    pub async fn execute(
        &self,
        req: &Request<Bytes>,
        tracer: &mut TimingTracer,
    ) -> Result<WireResponse, WireError> {
        let uri = req.uri();
        let https = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            other => {
                return Err(WireError::BadUrl(format!(
                    "unsupported scheme {:?}",
                    other.unwrap_or("")
                )));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| WireError::BadUrl("missing host".into()))?;
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        tracer.dns_start();
        let mut addrs = lookup_host((host, port)).await.map_err(WireError::Dns)?;
        tracer.dns_done();
        let addr = addrs
            .next()
            .ok_or_else(|| WireError::NoAddress(host.to_owned()))?;

        tracer.connect_start();
        let tcp = TcpStream::connect(addr).await.map_err(WireError::Connect)?;
        tracer.connect_done();

        let mut stream: Box<dyn Conn> = if https {
            let server_name = ServerName::try_from(host.to_owned())
                .map_err(|_| WireError::ServerName(host.to_owned()))?;
            tracer.tls_start();
            let tls = self
                .tls
                .connect(server_name, tcp)
                .await
                .map_err(|err| WireError::Tls(io::Error::other(err)))?;
            tracer.tls_done();
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        stream.write_all(&serialize_head(req)).await?;
        let body = req.body();
        if !body.is_empty() {
            stream.write_all(body).await?;
        }
        stream.flush().await?;
        tracer.wrote_request();

        read_response(&mut stream, req.method(), tracer).await
    }
}

impl Default for WireClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes the request line and headers. A `Content-Length` is added for
/// non-empty bodies and `Connection: close` is forced so that close-delimited
/// responses terminate.
fn serialize_head(req: &Request<Bytes>) -> Vec<u8> {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), target).as_bytes());

    for (name, value) in req.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    if !req.body().is_empty() && !req.headers().contains_key(CONTENT_LENGTH) {
        head.extend_from_slice(format!("content-length: {}\r\n", req.body().len()).as_bytes());
    }
    if !req.headers().contains_key(CONNECTION) {
        head.extend_from_slice(b"connection: close\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

async fn read_response(
    stream: &mut Box<dyn Conn>,
    method: &Method,
    tracer: &mut TimingTracer,
) -> Result<WireResponse, WireError> {
    let mut reader = ResponseReader::new(stream);

    // Accumulate until the full header block is buffered.
    let head_end = loop {
        if let Some(end) = find_head_end(reader.buffered()) {
            break end;
        }
        if reader.at_eof() {
            return Err(WireError::MalformedResponse(
                "connection closed before response headers".into(),
            ));
        }
        let n = reader.fill().await?;
        if n > 0 {
            tracer.first_byte();
        }
    };

    let (status, headers) = parse_head(&reader.buffered()[..head_end])?;
    reader.consume(head_end + 4);

    let body_bytes = if *method == Method::HEAD
        || status == 204
        || status == 304
        || (100..200).contains(&status)
    {
        0
    } else if header_value(&headers, "transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        reader.drain_chunked().await?
    } else if let Some(len) = header_value(&headers, "content-length") {
        let len: u64 = len.trim().parse().map_err(|_| {
            WireError::MalformedResponse(format!("bad content-length `{len}`"))
        })?;
        reader.drain_exact(len).await?
    } else {
        reader.drain_to_eof().await?
    };

    Ok(WireResponse {
        status,
        headers,
        body_bytes,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_head(head: &[u8]) -> Result<(u16, Vec<(String, String)>), WireError> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| WireError::MalformedResponse("empty status line".into()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            WireError::MalformedResponse(format!("bad status line `{status_line}`"))
        })?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(WireError::MalformedResponse(format!(
                "bad header line `{line}`"
            )));
        };
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
    }

    Ok((status, headers))
}

/// Buffered reader that counts drained body bytes instead of keeping them.
struct ResponseReader<'a> {
    stream: &'a mut Box<dyn Conn>,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<'a> ResponseReader<'a> {
    fn new(stream: &'a mut Box<dyn Conn>) -> Self {
        ResponseReader {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            eof: false,
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn at_eof(&self) -> bool {
        self.eof && self.pos >= self.buf.len()
    }

    fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }

    async fn fill(&mut self) -> Result<usize, WireError> {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    /// Drains exactly `len` body bytes.
    async fn drain_exact(&mut self, len: u64) -> Result<u64, WireError> {
        let mut remaining = len;
        loop {
            let take = (self.buffered().len() as u64).min(remaining);
            self.consume(take as usize);
            remaining -= take;
            if remaining == 0 {
                return Ok(len);
            }
            if self.eof {
                return Err(WireError::MalformedResponse("body truncated".into()));
            }
            self.fill().await?;
        }
    }

    /// Drains until the peer closes the connection.
    async fn drain_to_eof(&mut self) -> Result<u64, WireError> {
        let mut count = self.buffered().len() as u64;
        self.consume(self.buffered().len());
        while !self.eof {
            count += self.fill().await? as u64;
            self.consume(self.buffered().len());
        }
        Ok(count)
    }

    /// Reads one CRLF-terminated line (without the terminator).
    async fn read_line(&mut self) -> Result<String, WireError> {
        loop {
            if let Some(end) = self.buffered().windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8_lossy(&self.buffered()[..end]).into_owned();
                self.consume(end + 2);
                return Ok(line);
            }
            if self.eof {
                return Err(WireError::MalformedResponse(
                    "connection closed inside chunked body".into(),
                ));
            }
            self.fill().await?;
        }
    }

    /// Drains a chunked body, returning the decoded length.
    async fn drain_chunked(&mut self) -> Result<u64, WireError> {
        let mut total = 0u64;
        loop {
            let size_line = self.read_line().await?;
            let size_str = size_line.split(';').next().unwrap_or("").trim();
            let size = u64::from_str_radix(size_str, 16).map_err(|_| {
                WireError::MalformedResponse(format!("bad chunk size `{size_line}`"))
            })?;

            if size == 0 {
                // Trailer section ends with an empty line.
                loop {
                    if self.read_line().await?.is_empty() {
                        return Ok(total);
                    }
                }
            }

            self.drain_exact(size).await?;
            total += size;
            let terminator = self.read_line().await?;
            if !terminator.is_empty() {
                return Err(WireError::MalformedResponse(
                    "missing chunk terminator".into(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serves one canned response and captures the request bytes.
    async fn one_shot_server(
        response: &'static [u8],
    ) -> (String, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_full_request(&mut socket).await;
            socket.write_all(response).await.unwrap();
            socket.shutdown().await.unwrap();
            let _ = tx.send(request);
        });

        (format!("http://{addr}"), rx)
    }

    /// Reads until the head and any content-length body are complete.
    async fn read_full_request(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut request = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return request;
            }
            request.extend_from_slice(&chunk[..n]);

            let Some(head_end) = find_head_end(&request) else {
                continue;
            };
            let head = String::from_utf8_lossy(&request[..head_end]).to_ascii_lowercase();
            let body_len: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            if request.len() >= head_end + 4 + body_len {
                return request;
            }
        }
    }

    fn get(url: &str) -> Request<Bytes> {
        Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn content_length_framing() {
        let (base, request_rx) = one_shot_server(
            b"HTTP/1.1 200 OK\r\ncontent-length: 11\r\ncontent-type: text/plain\r\n\r\nhello world",
        )
        .await;

        let mut tracer = TimingTracer::start();
        let response = WireClient::new()
            .execute(&get(&format!("{base}/bucket/key")), &mut tracer)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body_bytes, 11);
        assert_eq!(response.header("Content-Type"), Some("text/plain"));

        let request = String::from_utf8(request_rx.await.unwrap()).unwrap();
        assert!(request.starts_with("GET /bucket/key HTTP/1.1\r\n"));
        assert!(request.contains("connection: close\r\n"));

        let timings = tracer.finish(std::time::Instant::now());
        assert!(timings.total >= timings.ttfb);
        assert!(timings.tcp_connect > std::time::Duration::ZERO);
    }

    #[tokio::test]
    async fn chunked_framing() {
        let (base, _rx) = one_shot_server(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await;

        let mut tracer = TimingTracer::start();
        let response = WireClient::new()
            .execute(&get(&base), &mut tracer)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body_bytes, 9);
    }

    #[tokio::test]
    async fn close_delimited_framing() {
        let (base, _rx) =
            one_shot_server(b"HTTP/1.1 200 OK\r\n\r\nstreamed until close").await;

        let mut tracer = TimingTracer::start();
        let response = WireClient::new()
            .execute(&get(&base), &mut tracer)
            .await
            .unwrap();

        assert_eq!(response.body_bytes, 20);
    }

    #[tokio::test]
    async fn head_requests_carry_no_body() {
        let (base, _rx) =
            one_shot_server(b"HTTP/1.1 200 OK\r\ncontent-length: 1024\r\n\r\n").await;

        let req = Request::builder()
            .method(Method::HEAD)
            .uri(base)
            .body(Bytes::new())
            .unwrap();

        let mut tracer = TimingTracer::start();
        let response = WireClient::new().execute(&req, &mut tracer).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_bytes, 0);
    }

    #[tokio::test]
    async fn put_sends_body_and_content_length() {
        let (base, request_rx) =
            one_shot_server(b"HTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n").await;

        let req = Request::builder()
            .method(Method::PUT)
            .uri(format!("{base}/bucket/key"))
            .body(Bytes::from_static(b"payload"))
            .unwrap();

        let mut tracer = TimingTracer::start();
        let response = WireClient::new().execute(&req, &mut tracer).await.unwrap();
        assert_eq!(response.status, 201);

        let request = String::from_utf8(request_rx.await.unwrap()).unwrap();
        assert!(request.contains("content-length: 7\r\n"));
        assert!(request.ends_with("payload"));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let (base, _rx) =
            one_shot_server(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\nshort").await;

        let mut tracer = TimingTracer::start();
        let result = WireClient::new().execute(&get(&base), &mut tracer).await;
        assert!(matches!(result, Err(WireError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("ftp://example.com/file")
            .body(Bytes::new())
            .unwrap();
        let mut tracer = TimingTracer::start();
        let result = WireClient::new().execute(&req, &mut tracer).await;
        assert!(matches!(result, Err(WireError::BadUrl(_))));
    }
}
