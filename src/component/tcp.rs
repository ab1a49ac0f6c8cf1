//! Bridges tunnels and plain TCP sockets.
//!
//! With `listen` and `pass`, accepted sockets become tunnels to `pass`.
//! Inbound tunnels are connected to `target`, or to the destination the
//! originator asked for when no target is configured.

use std::net::SocketAddr;
use std::sync::Arc;

use meshlink_core::address::Address;
use meshlink_core::protocol::{ComponentDescriptor, ConnectContext, ErrorInfo};
use meshlink_core::tunnel::Tunnel;
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};

use crate::component::{parse_options, Acknowledge, Component, ComponentContext};
use crate::error::{Error, Result};

#[derive(Deserialize)]
struct TcpOptions {
    #[serde(default)]
    listen: Option<SocketAddr>,
    #[serde(default)]
    pass: Option<Address>,
    #[serde(default)]
    target: Option<String>,
}

pub struct TcpComponent {
    name: Address,
    options: TcpOptions,
}

impl TcpComponent {
    pub fn create(descriptor: &ComponentDescriptor) -> Result<Arc<dyn Component>> {
        let options: TcpOptions = parse_options(descriptor)?;
        if options.listen.is_some() && options.pass.is_none() {
            return Err(Error::InvalidOptions {
                name: descriptor.name.clone(),
                reason: "listen requires pass".to_string(),
            });
        }
        Ok(Arc::new(TcpComponent {
            name: descriptor.name.clone(),
            options,
        }))
    }
}

#[async_trait::async_trait]
impl Component for TcpComponent {
    async fn on_ready(&self, ctx: ComponentContext) -> Result<()> {
        let (Some(listen), Some(pass)) = (self.options.listen, self.options.pass.clone()) else {
            return Ok(());
        };
        let listener = TcpListener::bind(listen).await?;
        log::info!("{} listening on {}", self.name, listener.local_addr()?);
        tokio::spawn(accept_loop(listener, pass, ctx));
        Ok(())
    }

    fn on_connection(&self, mut tunnel: Tunnel, context: ConnectContext, ack: Acknowledge) {
        let Some(target) = self.options.target.clone().or(context.destination.clone()) else {
            ack.reject(ErrorInfo::new(format!("{} has no target", self.name)));
            return;
        };
        tokio::spawn(async move {
            let mut stream = match TcpStream::connect(&target).await {
                Ok(stream) => stream,
                Err(e) => {
                    log::debug!("tcp connect {target} failed: {e}");
                    ack.reject(ErrorInfo::from_error(&e));
                    return;
                }
            };
            let _ = stream.set_nodelay(true);
            ack.accept(Vec::new());
            if let Err(e) = tokio::io::copy_bidirectional(&mut tunnel, &mut stream).await {
                log::debug!("tcp {target} ended: {e}");
            }
        });
    }
}

async fn accept_loop(listener: TcpListener, pass: Address, ctx: ComponentContext) {
    loop {
        let (mut stream, addr) = tokio::select! {
            _ = ctx.closed() => break,
            rs = listener.accept() => match rs {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("{} accept failed: {e}", ctx.name());
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        let context = ConnectContext::default()
            .with_source(addr.to_string())
            .with_protocol("tcp");
        let (mut tunnel, connecting) = ctx.connect(pass.clone(), context);
        let pass = pass.clone();
        tokio::spawn(async move {
            if let Err(error) = connecting.await {
                log::debug!("tcp {addr} -> {pass} refused: {error}");
                return;
            }
            if let Err(e) = tokio::io::copy_bidirectional(&mut stream, &mut tunnel).await {
                log::debug!("tcp {addr} -> {pass} ended: {e}");
            }
        });
    }
}
