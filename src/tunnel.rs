use crate::auth::Auth;
use crate::buffer_pool::{BufferPair, BufferPool};
use crate::config::ProxyEndpoint;
use http::{HeaderValue, StatusCode};
use std::future::Future;
use std::io::{self, Write};
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_RESPONSE_HEADERS: usize = 64;

/// Error type for HTTP CONNECT tunnel establishment
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid upstream {addr}: {reason}")]
    InvalidUpstream { addr: String, reason: &'static str },

    #[error("invalid tunnel target {0:?}")]
    InvalidTarget(String),

    #[error("CONNECT request does not fit in the {limit} byte write buffer")]
    RequestTooLarge { limit: usize },

    #[error("upstream {upstream} unreachable: {source}")]
    UpstreamUnreachable {
        upstream: String,
        source: io::Error,
    },

    #[error("upstream {upstream} rejected tunnel to {target}: {status}")]
    TunnelRejected {
        upstream: String,
        target: String,
        status: String,
    },

    #[error("tunnel to {target} via {upstream} timed out or was cancelled")]
    DialTimeout { upstream: String, target: String },
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Upstream connection with an established CONNECT tunnel.
///
/// `early_data` holds destination bytes that arrived in the same read as the
/// end of the CONNECT response; they must be delivered before anything read
/// from `stream`.
#[derive(Debug)]
pub struct TunnelConnection {
    stream: TcpStream,
    early_data: Vec<u8>,
}

impl TunnelConnection {
    pub fn into_parts(self) -> (TcpStream, Vec<u8>) {
        (self.stream, self.early_data)
    }
}

struct ResponseHead {
    code: u16,
    status_line: String,
    header_len: usize,
    filled: usize,
}

/// Opens CONNECT tunnels through one upstream HTTP proxy
#[derive(Debug)]
pub struct TunnelDialer {
    upstream: String,
    host: String,
    port: u16,
    auth_header: Option<HeaderValue>,
    pool: Arc<BufferPool>,
    timeout: Duration,
}

impl TunnelDialer {
    pub fn new(
        endpoint: &ProxyEndpoint,
        pool: Arc<BufferPool>,
        timeout: Duration,
    ) -> TunnelResult<Self> {
        let upstream = endpoint.host_port();
        let invalid = |reason| TunnelError::InvalidUpstream {
            addr: upstream.clone(),
            reason,
        };

        if endpoint.address.is_empty() {
            return Err(invalid("empty address"));
        }
        if endpoint
            .address
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/')
        {
            return Err(invalid("malformed host"));
        }
        if endpoint.port == 0 {
            return Err(invalid("port must not be zero"));
        }

        // A colon is only legal inside an IPv6 literal
        let host = endpoint.address.trim_start_matches('[').trim_end_matches(']');
        if host.contains(':') && host.parse::<Ipv6Addr>().is_err() {
            return Err(invalid("malformed host"));
        }
        let host = host.to_string();

        let auth_header = Auth::upstream(endpoint.username.as_deref(), endpoint.password.as_deref())
            .map(|auth| auth.basic_header())
            .transpose()
            .map_err(|_| invalid("credentials are not a valid header value"))?;

        Ok(Self {
            upstream,
            host,
            port: endpoint.port,
            auth_header,
            pool,
            timeout,
        })
    }

    /// Upstream `host:port`
    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Open a tunnel to `target` (`host:port`) through the upstream proxy.
    ///
    /// Connect, request write and response read are each bounded by the dial
    /// timeout; cancelling `cancel` aborts whichever step is in flight.
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        target: &str,
    ) -> TunnelResult<TunnelConnection> {
        if target.is_empty()
            || target
                .bytes()
                .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(TunnelError::InvalidTarget(target.to_string()));
        }

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let mut stream = self
            .bounded(cancel, target, connect)
            .await?
            .map_err(|source| self.unreachable(source))?;

        let mut buffers = self.pool.acquire().await;
        let result = self
            .handshake(cancel, &mut stream, target, &mut buffers)
            .await;
        self.pool.release(buffers).await;

        let early_data = result?;
        debug!(
            upstream = %self.upstream,
            target,
            early = early_data.len(),
            "tunnel established"
        );
        Ok(TunnelConnection { stream, early_data })
    }

    async fn handshake(
        &self,
        cancel: &CancellationToken,
        stream: &mut TcpStream,
        target: &str,
        buffers: &mut BufferPair,
    ) -> TunnelResult<Vec<u8>> {
        let len = self.encode_request(target, &mut buffers.write)?;
        self.bounded(cancel, target, stream.write_all(&buffers.write[..len]))
            .await?
            .map_err(|source| self.unreachable(source))?;

        let head = self
            .bounded(cancel, target, self.read_response(stream, &mut buffers.read, target))
            .await??;

        let success = StatusCode::from_u16(head.code)
            .map(|status| status.is_success())
            .unwrap_or(false);
        if !success {
            return Err(self.rejected(target, head.status_line));
        }

        Ok(buffers.read[head.header_len..head.filled].to_vec())
    }

    fn encode_request(&self, target: &str, buf: &mut [u8]) -> TunnelResult<usize> {
        let limit = buf.len();
        let mut cursor = io::Cursor::new(buf);
        write_request(&mut cursor, target, self.auth_header.as_ref())
            .map_err(|_| TunnelError::RequestTooLarge { limit })?;
        Ok(cursor.position() as usize)
    }

    async fn read_response(
        &self,
        stream: &mut TcpStream,
        buf: &mut [u8],
        target: &str,
    ) -> TunnelResult<ResponseHead> {
        let mut filled = 0;
        loop {
            if filled == buf.len() {
                return Err(self.rejected(
                    target,
                    format!("response header exceeds {} byte read buffer", buf.len()),
                ));
            }

            let n = stream
                .read(&mut buf[filled..])
                .await
                .map_err(|source| self.unreachable(source))?;
            if n == 0 {
                let status = if filled == 0 {
                    "upstream closed connection without a response"
                } else {
                    "upstream closed connection mid-response"
                };
                return Err(self.rejected(target, status.to_string()));
            }
            filled += n;

            let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
            let mut response = httparse::Response::new(&mut headers);
            match response.parse(&buf[..filled]) {
                Ok(httparse::Status::Complete(header_len)) => {
                    let code = response.code.unwrap_or_default();
                    let status_line = format!(
                        "HTTP/1.{} {} {}",
                        response.version.unwrap_or(1),
                        code,
                        response.reason.unwrap_or_default()
                    );
                    return Ok(ResponseHead {
                        code,
                        status_line: status_line.trim_end().to_string(),
                        header_len,
                        filled,
                    });
                }
                Ok(httparse::Status::Partial) => continue,
                Err(err) => {
                    return Err(self.rejected(target, format!("malformed response: {}", err)))
                }
            }
        }
    }

    async fn bounded<F, T>(&self, cancel: &CancellationToken, target: &str, fut: F) -> TunnelResult<T>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(self.timed_out(target)),
            res = tokio::time::timeout(self.timeout, fut) => res.map_err(|_| self.timed_out(target)),
        }
    }

    fn unreachable(&self, source: io::Error) -> TunnelError {
        TunnelError::UpstreamUnreachable {
            upstream: self.upstream.clone(),
            source,
        }
    }

    fn rejected(&self, target: &str, status: String) -> TunnelError {
        TunnelError::TunnelRejected {
            upstream: self.upstream.clone(),
            target: target.to_string(),
            status,
        }
    }

    fn timed_out(&self, target: &str) -> TunnelError {
        TunnelError::DialTimeout {
            upstream: self.upstream.clone(),
            target: target.to_string(),
        }
    }
}

fn write_request(w: &mut impl Write, target: &str, auth: Option<&HeaderValue>) -> io::Result<()> {
    write!(w, "CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target)?;
    if let Some(auth) = auth {
        w.write_all(b"Proxy-Authorization: ")?;
        w.write_all(auth.as_bytes())?;
        w.write_all(b"\r\n")?;
    }
    w.write_all(b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    async fn read_request_head(stream: &mut TcpStream) -> Vec<u8> {
        let mut request = Vec::new();
        let mut chunk = [0u8; 512];
        while !request.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
        }
        request
    }

    /// One-shot upstream: answers the CONNECT with `response`, then echoes.
    async fn spawn_upstream(response: &'static [u8]) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request_head(&mut stream).await;
            stream.write_all(response).await.unwrap();
            let mut buf = [0u8; 1024];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            request
        });
        (addr, handle)
    }

    fn endpoint(addr: SocketAddr, auth: Option<(&str, &str)>) -> ProxyEndpoint {
        ProxyEndpoint {
            address: addr.ip().to_string(),
            port: addr.port(),
            username: auth.map(|(u, _)| u.to_string()),
            password: auth.map(|(_, p)| p.to_string()),
        }
    }

    fn dialer(endpoint: &ProxyEndpoint, pool: &Arc<BufferPool>, timeout: Duration) -> TunnelDialer {
        TunnelDialer::new(endpoint, Arc::clone(pool), timeout).expect("valid upstream")
    }

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(4_096, 4_096))
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn dial_succeeds_on_200_and_sends_basic_auth() {
        let (addr, upstream) =
            spawn_upstream(b"HTTP/1.1 200 Connection Established\r\n\r\n").await;
        let pool = pool();
        let dialer = dialer(
            &endpoint(addr, Some(("alice", "secret"))),
            &pool,
            Duration::from_secs(5),
        );

        let conn = dialer
            .dial(&CancellationToken::new(), "example.org:443")
            .await
            .expect("tunnel established");
        let (mut stream, early_data) = conn.into_parts();
        assert!(early_data.is_empty());

        stream.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
        drop(stream);

        let request = upstream.await.unwrap();
        assert_eq!(
            String::from_utf8(request).unwrap(),
            "CONNECT example.org:443 HTTP/1.1\r\n\
             Host: example.org:443\r\n\
             Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn dial_without_credentials_omits_auth_header() {
        let (addr, upstream) = spawn_upstream(b"HTTP/1.0 200 OK\r\n\r\n").await;
        let pool = pool();
        let dialer = dialer(&endpoint(addr, None), &pool, Duration::from_secs(5));

        let conn = dialer
            .dial(&CancellationToken::new(), "10.1.2.3:22")
            .await
            .expect("tunnel established");
        drop(conn);

        let request = String::from_utf8(upstream.await.unwrap()).unwrap();
        assert!(request.starts_with("CONNECT 10.1.2.3:22 HTTP/1.1\r\n"));
        assert!(!request.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn dial_rejected_on_403_carries_status() {
        let (addr, _upstream) = spawn_upstream(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let pool = pool();
        let dialer = dialer(&endpoint(addr, None), &pool, Duration::from_secs(5));

        let err = dialer
            .dial(&CancellationToken::new(), "example.org:443")
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::TunnelRejected { .. }));
        assert!(err.to_string().contains("403"), "got: {}", err);
        assert!(err.to_string().contains("HTTP/1.1 403 Forbidden"));
    }

    #[tokio::test]
    async fn dial_rejects_malformed_response() {
        let (addr, _upstream) = spawn_upstream(b"garbage\r\n\r\n").await;
        let pool = pool();
        let dialer = dialer(&endpoint(addr, None), &pool, Duration::from_secs(5));

        let err = dialer
            .dial(&CancellationToken::new(), "example.org:443")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::TunnelRejected { .. }));
    }

    #[tokio::test]
    async fn dial_rejects_response_larger_than_read_buffer() {
        let (addr, _upstream) = spawn_upstream(
            b"HTTP/1.1 200 OK\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n",
        )
        .await;
        let pool = Arc::new(BufferPool::new(256, 256));
        let dialer = dialer(&endpoint(addr, None), &pool, Duration::from_secs(5));

        let err = dialer
            .dial(&CancellationToken::new(), "example.org:443")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds 256 byte read buffer"), "got: {}", err);
    }

    #[tokio::test]
    async fn dial_against_closed_port_is_unreachable() {
        let addr = closed_port().await;
        let pool = pool();
        let dialer = dialer(&endpoint(addr, None), &pool, Duration::from_secs(2));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            dialer.dial(&CancellationToken::new(), "example.org:443"),
        )
        .await
        .expect("dial must not hang")
        .unwrap_err();

        assert!(matches!(err, TunnelError::UpstreamUnreachable { .. }), "got: {}", err);
    }

    #[tokio::test]
    async fn dial_times_out_against_silent_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });
        let pool = pool();
        let dialer = dialer(&endpoint(addr, None), &pool, Duration::from_millis(200));

        let err = dialer
            .dial(&CancellationToken::new(), "example.org:443")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::DialTimeout { .. }), "got: {}", err);
    }

    #[tokio::test]
    async fn cancellation_aborts_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });
        let pool = pool();
        let dialer = dialer(&endpoint(addr, None), &pool, Duration::from_secs(30));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            dialer.dial(&cancel, "example.org:443"),
        )
        .await
        .expect("cancellation must end the dial")
        .unwrap_err();
        assert!(matches!(err, TunnelError::DialTimeout { .. }));
    }

    #[tokio::test]
    async fn bytes_after_response_header_are_kept() {
        const BANNER: &[u8] = b"SSH-2.0-OpenSSH_9.6\r\n";
        let (addr, _upstream) =
            spawn_upstream(b"HTTP/1.1 200 Connection established\r\n\r\nSSH-2.0-OpenSSH_9.6\r\n")
                .await;
        let pool = pool();
        let dialer = dialer(&endpoint(addr, None), &pool, Duration::from_secs(5));

        let conn = dialer
            .dial(&CancellationToken::new(), "git.example:22")
            .await
            .expect("tunnel established");
        let (mut stream, mut data) = conn.into_parts();
        while data.len() < BANNER.len() {
            let mut chunk = [0u8; 64];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "banner truncated");
            data.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(data, BANNER);
    }

    #[tokio::test]
    async fn buffers_return_to_pool_on_success_and_failure() {
        let pool = pool();

        let (ok_addr, _ok) = spawn_upstream(b"HTTP/1.1 200 OK\r\n\r\n").await;
        let ok = dialer(&endpoint(ok_addr, None), &pool, Duration::from_secs(5));
        let conn = ok.dial(&CancellationToken::new(), "a.example:1").await.unwrap();
        drop(conn);

        let (bad_addr, _bad) = spawn_upstream(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
        let bad = dialer(&endpoint(bad_addr, None), &pool, Duration::from_secs(5));
        assert!(bad.dial(&CancellationToken::new(), "b.example:1").await.is_err());

        let stats = pool.stats().await;
        assert_eq!(stats.allocated_pairs, 1);
        assert_eq!(stats.idle_pairs, 1);
    }

    #[tokio::test]
    async fn invalid_target_is_refused_before_connecting() {
        let pool = pool();
        let dialer = dialer(&endpoint(closed_port().await, None), &pool, Duration::from_secs(1));

        let err = dialer
            .dial(&CancellationToken::new(), "evil.example:80\r\nX-Injected: 1")
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::InvalidTarget(_)));
        assert_eq!(pool.stats().await.allocated_pairs, 0);
    }

    #[tokio::test]
    async fn oversized_request_is_refused() {
        let (addr, _upstream) = spawn_upstream(b"HTTP/1.1 200 OK\r\n\r\n").await;
        let pool = Arc::new(BufferPool::new(256, 256));
        let dialer = dialer(&endpoint(addr, None), &pool, Duration::from_secs(5));
        let target = format!("{}.example:443", "a".repeat(200));

        let err = dialer
            .dial(&CancellationToken::new(), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::RequestTooLarge { limit: 256 }));
    }

    #[test]
    fn new_rejects_malformed_upstreams() {
        let pool = pool();
        let mut endpoint = ProxyEndpoint {
            address: String::new(),
            port: 8080,
            username: None,
            password: None,
        };
        let timeout = Duration::from_secs(1);

        let err = TunnelDialer::new(&endpoint, Arc::clone(&pool), timeout).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidUpstream { .. }));

        endpoint.address = "http://proxy".to_string();
        assert!(TunnelDialer::new(&endpoint, Arc::clone(&pool), timeout).is_err());

        endpoint.address = "proxy.example:8080".to_string();
        let err = TunnelDialer::new(&endpoint, Arc::clone(&pool), timeout).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidUpstream { reason: "malformed host", .. }));

        endpoint.address = "[::1]".to_string();
        let bracketed = TunnelDialer::new(&endpoint, Arc::clone(&pool), timeout).expect("valid");
        assert_eq!(bracketed.host, "::1");

        endpoint.address = "fe80::zz".to_string();
        assert!(TunnelDialer::new(&endpoint, Arc::clone(&pool), timeout).is_err());

        endpoint.address = "proxy.example".to_string();
        endpoint.port = 0;
        assert!(TunnelDialer::new(&endpoint, Arc::clone(&pool), timeout).is_err());

        endpoint.port = 3128;
        let dialer = TunnelDialer::new(&endpoint, pool, timeout).expect("valid");
        assert_eq!(dialer.upstream(), "proxy.example:3128");
    }

    #[test]
    fn ipv6_upstream_host_is_unbracketed_for_connect() {
        let endpoint = ProxyEndpoint {
            address: "::1".to_string(),
            port: 3128,
            username: None,
            password: None,
        };
        let dialer = TunnelDialer::new(&endpoint, pool(), Duration::from_secs(1)).expect("valid");
        assert_eq!(dialer.upstream(), "[::1]:3128");
        assert_eq!(dialer.host, "::1");
    }
}
