use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::node;
use crate::MeshHandle;

/// Exponential delay between dial attempts.
#[derive(Debug)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Keeps a link to `server` up until the mesh shuts down.
pub(crate) async fn dial_loop(handle: MeshHandle, server: ServerConfig) {
    let config = handle.config();
    let mut backoff = Backoff::new(config.reconnect_base, config.reconnect_max);
    let shutdown = handle.shutdown_token().clone();
    loop {
        let rs = tokio::select! {
            _ = shutdown.cancelled() => return,
            rs = dial(&handle, &server) => rs,
        };
        match rs {
            Ok(link_token) => {
                backoff.reset();
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = link_token.cancelled() => {}
                }
            }
            Err(e) => log::warn!("dial {} at {} failed: {e}", server.name, server.addr),
        }
        let delay = backoff.next_delay();
        log::debug!("redial {} in {delay:?}", server.name);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn dial(handle: &MeshHandle, server: &ServerConfig) -> Result<CancellationToken> {
    let stream = TcpStream::connect(server.socket_addr()).await?;
    stream.set_nodelay(true)?;
    let link = node::connect(stream, Some(&server.name), &server.token, handle).await?;
    Ok(link.token)
}
