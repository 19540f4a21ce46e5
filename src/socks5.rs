use crate::auth::Auth;
use crate::logging::SocksLog;
use crate::tunnel::{TunnelDialer, TunnelError};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0x01;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Pause after a failed accept so descriptor exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Client bytes buffered while the tunnel is being dialled; beyond this the
/// client is no longer read until the dial finishes.
const MAX_PENDING_CLIENT_BYTES: usize = 64 * 1024;

/// Error type for the client side of a SOCKS5 session
#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version {0}")]
    Version(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported auth sub-negotiation version {0}")]
    AuthVersion(u8),

    #[error("authentication failed for user {0:?}")]
    AuthFailed(String),

    #[error("unsupported command {0}")]
    Command(u8),

    #[error("unsupported address type {0}")]
    AddressType(u8),

    #[error("domain name is not valid UTF-8")]
    Domain,

    #[error("domain name is empty")]
    EmptyDomain,

    #[error("failed to tunnel to {target}: {source}")]
    Dial {
        target: String,
        source: TunnelError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// SOCKS5 reply field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    HostUnreachable,
    ConnectionRefused,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl From<Reply> for u8 {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Succeeded => 0x00,
            Reply::GeneralFailure => 0x01,
            Reply::HostUnreachable => 0x04,
            Reply::ConnectionRefused => 0x05,
            Reply::CommandNotSupported => 0x07,
            Reply::AddressTypeNotSupported => 0x08,
        }
    }
}

impl Reply {
    /// Nearest reply code for a failed tunnel
    pub fn for_dial_error(err: &TunnelError) -> Self {
        match err {
            TunnelError::UpstreamUnreachable { source, .. }
                if source.kind() == io::ErrorKind::ConnectionRefused =>
            {
                Reply::ConnectionRefused
            }
            TunnelError::UpstreamUnreachable { .. } | TunnelError::DialTimeout { .. } => {
                Reply::HostUnreachable
            }
            TunnelError::TunnelRejected { .. }
            | TunnelError::InvalidTarget(_)
            | TunnelError::InvalidUpstream { .. }
            | TunnelError::RequestTooLarge { .. } => Reply::GeneralFailure,
        }
    }
}

/// Destination requested by a SOCKS5 client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Method selection plus the optional username/password sub-negotiation
pub async fn negotiate<S>(stream: &mut S, auth: Option<&Auth>) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != VERSION {
        return Err(Socks5Error::Version(version));
    }
    let count = stream.read_u8().await?;
    let mut methods = vec![0u8; count as usize];
    stream.read_exact(&mut methods).await?;

    let wanted = if auth.is_some() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    if !methods.contains(&wanted) {
        stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    stream.write_all(&[VERSION, wanted]).await?;

    let Some(auth) = auth else {
        return Ok(());
    };

    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(Socks5Error::AuthVersion(version));
    }
    let username = read_short_field(stream).await?;
    let password = read_short_field(stream).await?;
    if auth.matches(&username, &password) {
        stream.write_all(&[AUTH_VERSION, AUTH_SUCCESS]).await?;
        Ok(())
    } else {
        stream.write_all(&[AUTH_VERSION, AUTH_FAILURE]).await?;
        Err(Socks5Error::AuthFailed(
            String::from_utf8_lossy(&username).into_owned(),
        ))
    }
}

async fn read_short_field<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await?;
    let mut field = vec![0u8; len as usize];
    stream.read_exact(&mut field).await?;
    Ok(field)
}

/// Read a request and return its CONNECT target.
///
/// Other commands and unknown address types are answered with the matching
/// failure reply before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    if version != VERSION {
        return Err(Socks5Error::Version(version));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                0,
                0,
            )))
        }
        ATYP_DOMAIN => {
            let domain = read_short_field(stream).await?;
            let port = stream.read_u16().await?;
            if domain.is_empty() {
                write_reply(stream, Reply::GeneralFailure, None).await?;
                return Err(Socks5Error::EmptyDomain);
            }
            match String::from_utf8(domain) {
                Ok(host) => TargetAddr::Domain(host, port),
                Err(_) => {
                    write_reply(stream, Reply::GeneralFailure, None).await?;
                    return Err(Socks5Error::Domain);
                }
            }
        }
        other => {
            write_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(Socks5Error::AddressType(other));
        }
    };

    if command != CMD_CONNECT {
        write_reply(stream, Reply::CommandNotSupported, None).await?;
        return Err(Socks5Error::Command(command));
    }
    Ok(target)
}

/// Write a reply; `bind` defaults to `0.0.0.0:0`
pub async fn write_reply<S>(stream: &mut S, reply: Reply, bind: Option<SocketAddr>) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bind = bind.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let mut msg = Vec::with_capacity(22);
    msg.extend_from_slice(&[VERSION, reply.into(), 0x00]);
    match bind {
        SocketAddr::V4(addr) => {
            msg.push(ATYP_IPV4);
            msg.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            msg.push(ATYP_IPV6);
            msg.extend_from_slice(&addr.ip().octets());
        }
    }
    msg.extend_from_slice(&bind.port().to_be_bytes());
    stream.write_all(&msg).await
}

/// Send the failure reply for a dial error and hand the dial error back.
///
/// A client that is already gone cannot take the reply; the dial error is
/// still what gets reported.
async fn reject_dial<S>(stream: &mut S, target: String, source: TunnelError) -> Socks5Error
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = write_reply(stream, Reply::for_dial_error(&source), None).await {
        debug!(target = %target, "fail to send failure reply: {}", e);
    }
    Socks5Error::Dial { target, source }
}

/// Resolves once the client has closed its side or errored.
///
/// Bytes the client sends in the meantime are drained into `pending` so a
/// later hang-up is still seen; they belong to the tunnel and must be
/// forwarded upstream once it is open.
async fn client_gone(stream: &mut TcpStream, pending: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    while pending.len() < MAX_PENDING_CLIENT_BYTES {
        let room = (MAX_PENDING_CLIENT_BYTES - pending.len()).min(chunk.len());
        match stream.read(&mut chunk[..room]).await {
            Ok(0) | Err(_) => return,
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
        }
    }
    std::future::pending::<()>().await;
}

/// SOCKS5 front-end that satisfies CONNECT requests through one [`TunnelDialer`]
#[derive(Debug, Clone)]
pub struct Socks5Server {
    dialer: Arc<TunnelDialer>,
    log: SocksLog,
    auth: Option<Arc<Auth>>,
}

impl Socks5Server {
    pub fn new(dialer: Arc<TunnelDialer>, log: SocksLog, auth: Option<Auth>) -> Self {
        Self {
            dialer,
            log,
            auth: auth.map(Arc::new),
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.auth.is_some()
    }

    /// Accept clients until `shutdown` fires, one task per connection.
    ///
    /// Accept errors are logged and retried unless the listener itself is
    /// unusable. In-flight connections are left to finish on their own.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move { server.handle(stream, peer).await });
                    }
                    Err(e) if e.kind() == io::ErrorKind::InvalidInput => return Err(e),
                    Err(e) => {
                        self.log.line(&format!("[ERR] socks: accept error: {} (continuing)", e));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    async fn handle(self, mut stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = self.serve_connection(&mut stream).await {
            self.log
                .line(&format!("[ERR] socks: Failed to handle request from {}: {}", peer, err));
        }
    }

    async fn serve_connection(&self, stream: &mut TcpStream) -> Result<(), Socks5Error> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(who = self.log.who(), "fail to set TCP_NODELAY: {}", e);
        }
        negotiate(stream, self.auth.as_deref()).await?;
        let target = read_request(stream).await?.to_string();

        // A client hanging up mid-handshake cancels the dial; the dial still
        // runs to completion so its buffers go back to the pool.
        let cancel = CancellationToken::new();
        let mut pending = Vec::new();
        let result = {
            let dial = self.dialer.dial(&cancel, &target);
            tokio::pin!(dial);
            let finished = tokio::select! {
                res = &mut dial => Some(res),
                _ = client_gone(stream, &mut pending) => None,
            };
            match finished {
                Some(res) => res,
                None => {
                    cancel.cancel();
                    dial.await
                }
            }
        };

        let conn = match result {
            Ok(conn) => conn,
            Err(source) => return Err(reject_dial(stream, target, source).await),
        };
        debug!(
            who = self.log.who(),
            upstream = self.dialer.upstream(),
            target = %target,
            "tunnel open"
        );

        let (mut upstream, early_data) = conn.into_parts();
        write_reply(stream, Reply::Succeeded, upstream.local_addr().ok()).await?;
        if !early_data.is_empty() {
            stream.write_all(&early_data).await?;
        }
        if !pending.is_empty() {
            upstream.write_all(&pending).await?;
        }
        let (sent, received) = tokio::io::copy_bidirectional(stream, &mut upstream).await?;
        debug!(who = self.log.who(), target = %target, sent, received, "tunnel closed");
        Ok(())
    }
}
