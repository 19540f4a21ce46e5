use crate::auth::Auth;
use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::server::{PairServer, ServerError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Every configured pair server, keyed by SOCKS5 bind `address:port`
#[derive(Debug)]
pub struct Registry {
    servers: BTreeMap<String, Arc<PairServer>>,
}

impl Registry {
    /// Construct all pair servers. Fails before anything is bound if a bind
    /// address repeats or an upstream is unusable.
    pub fn build(config: &Config, pool: Arc<BufferPool>) -> Result<Self, ServerError> {
        let mut servers = BTreeMap::new();
        for pair in &config.proxies {
            let key = pair.socks.host_port();
            if servers.contains_key(&key) {
                return Err(ServerError::DuplicateBind(key));
            }
            let auth = Auth::socks(pair.socks.username.as_deref(), pair.socks.password.as_deref());
            let server = PairServer::new(
                Arc::clone(&pool),
                &pair.http,
                key.clone(),
                auth,
                &config.settings,
            )?;
            servers.insert(key, Arc::new(server));
        }
        Ok(Self { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Start every pair server and wait for all of them to stop.
    ///
    /// Outcomes come back in bind-address order. One server failing leaves
    /// the others running.
    pub async fn run(self, shutdown: CancellationToken) -> Vec<(String, Result<(), ServerError>)> {
        let tasks: Vec<_> = self
            .servers
            .into_iter()
            .map(|(addr, server)| {
                info!(
                    who = "MGR",
                    auth = server.requires_auth(),
                    "start socks5 proxy on {} via {}",
                    server.socks5_description(),
                    server.upstream_description()
                );
                let shutdown = shutdown.clone();
                let runner = Arc::clone(&server);
                let task = tokio::spawn(async move { runner.listen_and_serve(shutdown).await });
                (addr, server, task)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (addr, server, task) in tasks {
            let outcome = match task.await {
                Ok(result) => result,
                Err(source) => Err(ServerError::Task {
                    addr: addr.clone(),
                    source,
                }),
            };
            match &outcome {
                Ok(()) => info!(who = "MGR", socks = %addr, state = %server.state(), "socks5 proxy stopped"),
                Err(err) => error!(who = "MGR", socks = %addr, state = %server.state(), "{}", err),
            }
            outcomes.push((addr, outcome));
        }
        outcomes
    }
}
