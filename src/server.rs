use crate::auth::Auth;
use crate::buffer_pool::BufferPool;
use crate::config::{ProxyEndpoint, Settings};
use crate::logging::SocksLog;
use crate::socks5::Socks5Server;
use crate::tunnel::{TunnelDialer, TunnelError};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Errors raised while building or running a pair server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid upstream for socks5://{socks}: {source}")]
    InvalidUpstream {
        socks: String,
        #[source]
        source: TunnelError,
    },

    #[error("socks5 address {0} is configured more than once")]
    DuplicateBind(String),

    #[error("fail to listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("listener on {addr} failed: {source}")]
    Accept { addr: String, source: io::Error },

    #[error("pair server on {addr} stopped abnormally: {source}")]
    Task {
        addr: String,
        source: tokio::task::JoinError,
    },
}

/// Lifecycle of one pair server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Constructed,
    Listening,
    Closed,
    Failed,
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairState::Constructed => "constructed",
            PairState::Listening => "listening",
            PairState::Closed => "closed",
            PairState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One SOCKS5 listener bound to one upstream HTTP proxy
#[derive(Debug)]
pub struct PairServer {
    socks_addr: String,
    upstream: String,
    frontend: Socks5Server,
    state: watch::Sender<PairState>,
}

impl PairServer {
    /// Build the dialer and front-end. Nothing is bound until
    /// [`PairServer::listen_and_serve`].
    pub fn new(
        pool: Arc<BufferPool>,
        http: &ProxyEndpoint,
        socks_addr: String,
        socks_auth: Option<Auth>,
        settings: &Settings,
    ) -> Result<Self, ServerError> {
        let dialer = TunnelDialer::new(http, pool, settings.dial_timeout).map_err(|source| {
            ServerError::InvalidUpstream {
                socks: socks_addr.clone(),
                source,
            }
        })?;
        let upstream = dialer.upstream().to_string();
        let frontend = Socks5Server::new(Arc::new(dialer), SocksLog::new(&socks_addr), socks_auth);
        let (state, _) = watch::channel(PairState::Constructed);

        Ok(Self {
            socks_addr,
            upstream,
            frontend,
            state,
        })
    }

    pub fn socks5_description(&self) -> &str {
        &self.socks_addr
    }

    pub fn upstream_description(&self) -> &str {
        &self.upstream
    }

    pub fn requires_auth(&self) -> bool {
        self.frontend.requires_auth()
    }

    pub fn state(&self) -> PairState {
        *self.state.borrow()
    }

    fn transition(&self, next: PairState) {
        let previous = self.state.send_replace(next);
        info!(
            who = "MGR",
            socks = %self.socks_addr,
            upstream = %self.upstream,
            "socks5 proxy {} -> {}",
            previous,
            next
        );
    }

    /// Bind the SOCKS5 listener and serve until `shutdown` fires
    pub async fn listen_and_serve(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listener = match TcpListener::bind(self.socks_addr.as_str()).await {
            Ok(listener) => listener,
            Err(source) => {
                self.transition(PairState::Failed);
                return Err(ServerError::Bind {
                    addr: self.socks_addr.clone(),
                    source,
                });
            }
        };
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        self.transition(PairState::Listening);

        match self.frontend.serve(listener, shutdown).await {
            Ok(()) => {
                self.transition(PairState::Closed);
                Ok(())
            }
            Err(source) => {
                error!(who = "MGR", socks = %self.socks_addr, "listener failed: {}", source);
                self.transition(PairState::Failed);
                Err(ServerError::Accept {
                    addr: self.socks_addr.clone(),
                    source,
                })
            }
        }
    }
}
