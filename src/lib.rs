//! An overlay tunneling mesh.
//!
//! Named nodes keep authenticated links to their neighbours, learn routes to
//! everyone else by distance-vector exchange, and carry tunnels (flow
//! controlled byte streams) between components hosted anywhere in the mesh.

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use meshlink_core::address::Address;
use meshlink_core::pipe::DATA_FRAME_OVERHEAD;
use meshlink_core::protocol::{ComponentDescriptor, ConnectContext, TunnelId};
use meshlink_core::route::Route;
use meshlink_core::tunnel::{Connecting, Tunnel};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod component;
pub mod config;
mod dispatcher;
pub mod error;
mod maintain;
mod node;

pub use meshlink_core::{address, pipe, protocol, route, tunnel};

use crate::component::{Component, ComponentFactories, ComponentFactory};
use crate::config::MeshConfig;
use crate::dispatcher::{Dispatcher, Event, EventSender, Query};
use crate::error::{Error, Result};

/// Cheap, cloneable access to a running node.
#[derive(Clone)]
pub struct MeshHandle {
    config: Arc<MeshConfig>,
    events: EventSender,
    shutdown: CancellationToken,
}

impl MeshHandle {
    pub fn name(&self) -> &str {
        &self.config.name
    }
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }
    pub(crate) fn send(&self, event: Event) -> std::result::Result<(), SendError<Event>> {
        self.events.send(event)
    }
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
    /// Opens a tunnel to `address`. The tunnel is returned at once and can be
    /// written before the peer acknowledges; [`Connecting`] resolves with the
    /// acknowledgement arguments or the reason the connect failed.
    pub fn connect(&self, address: Address, context: ConnectContext) -> (Tunnel, Connecting) {
        let (tunnel, wiring) = Tunnel::new(
            TunnelId::random(),
            Some(address.clone()),
            self.config.tunnel_buffer,
        );
        let connecting = wiring.control().connecting();
        let control = wiring.control().clone();
        let open = Event::Open {
            wiring,
            address,
            context,
        };
        if self.send(open).is_err() {
            control.destroy(Some(Error::Shutdown.to_info()));
        }
        (tunnel, connecting)
    }
    pub async fn routes(&self) -> Result<Vec<Route>> {
        self.query(Query::Routes).await
    }
    /// Names of the directly connected neighbours.
    pub async fn nodes(&self) -> Result<Vec<String>> {
        self.query(Query::Nodes).await
    }
    pub async fn components(&self) -> Result<Vec<Address>> {
        self.query(Query::Components).await
    }
    pub async fn find_next_hop(&self, node: &str) -> Result<Option<String>> {
        let node = node.to_string();
        self.query(move |reply| Query::NextHop(node, reply)).await
    }
    /// Hosts `instance` on this node as `component`.
    pub async fn register(
        &self,
        component: &str,
        instance: Arc<dyn Component>,
        options: Value,
    ) -> Result<()> {
        let descriptor = ComponentDescriptor::new(Address::new(self.name(), component), "custom")
            .with_options(options);
        let (done, wait) = oneshot::channel();
        self.send(Event::Register {
            descriptor,
            instance: Some(instance),
            done,
        })
        .map_err(|_| Error::Shutdown)?;
        wait.await.map_err(|_| Error::Shutdown)?
    }
    /// Creates a component from a descriptor through the registered types.
    pub async fn create(&self, descriptor: ComponentDescriptor) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Event::Register {
            descriptor,
            instance: None,
            done,
        })
        .map_err(|_| Error::Shutdown)?;
        wait.await.map_err(|_| Error::Shutdown)?
    }
    /// Removes a component; false if it was not registered.
    pub async fn unregister(&self, component: &str) -> Result<bool> {
        let (done, wait) = oneshot::channel();
        self.send(Event::Unregister {
            component: component.to_string(),
            done,
        })
        .map_err(|_| Error::Shutdown)?;
        wait.await.map_err(|_| Error::Shutdown)
    }
    /// Closes the link to a neighbour; false if it was not connected.
    pub async fn disconnect(&self, peer: &str) -> Result<bool> {
        let (done, wait) = oneshot::channel();
        self.send(Event::Disconnect {
            peer: peer.to_string(),
            done,
        })
        .map_err(|_| Error::Shutdown)?;
        wait.await.map_err(|_| Error::Shutdown)
    }
    /// Accepts a link over an already established byte stream.
    /// Returns the authenticated peer name.
    pub async fn attach_inbound<S>(&self, stream: S) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Ok(node::accept(stream, self).await?.peer)
    }
    /// Dials a link over an already established byte stream.
    /// Returns the name the acceptor reported.
    pub async fn attach_outbound<S>(&self, stream: S, token: &str) -> Result<String>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Ok(node::connect(stream, None, token, self).await?.peer)
    }
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
    async fn query<T, F>(&self, query: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Query,
    {
        let (reply, wait) = oneshot::channel();
        self.send(Event::Query(query(reply)))
            .map_err(|_| Error::Shutdown)?;
        wait.await.map_err(|_| Error::Shutdown)
    }
}

struct OwnedJoinHandle {
    handle: JoinHandle<()>,
}

impl Drop for OwnedJoinHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A running node. Dropping it shuts the node down.
pub struct Mesh {
    handle: MeshHandle,
    local_addr: Option<SocketAddr>,
    _dispatcher: OwnedJoinHandle,
}

impl Mesh {
    pub fn handle(&self) -> MeshHandle {
        self.handle.clone()
    }
    /// Address of the TCP listener, when one is configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
    /// Stops the node and waits for the dispatcher to finish.
    pub async fn shutdown(mut self) {
        self.handle.shutdown();
        let handle = &mut self._dispatcher.handle;
        let _ = handle.await;
    }
}

impl Deref for Mesh {
    type Target = MeshHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

pub struct Builder {
    config: MeshConfig,
    factories: ComponentFactories,
    components: Vec<(String, Arc<dyn Component>, Value)>,
}

impl Builder {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            factories: ComponentFactories::default(),
            components: Vec::new(),
        }
    }
    /// Makes a component type available to configuration and `regist`.
    pub fn component_type(mut self, kind: impl Into<String>, factory: ComponentFactory) -> Self {
        self.factories.insert(kind, factory);
        self
    }
    /// Hosts a ready-made component on this node.
    pub fn component(mut self, name: impl Into<String>, instance: Arc<dyn Component>) -> Self {
        self.components.push((name.into(), instance, Value::Null));
        self
    }
    pub async fn build(self) -> Result<Mesh> {
        let Builder {
            config,
            factories,
            components,
        } = self;
        if config.name.is_empty() || config.name.contains('/') {
            return Err(Error::Core(meshlink_core::error::Error::InvalidAddress(
                config.name,
            )));
        }
        if config.max_chunk == 0
            || config.max_chunk.saturating_add(DATA_FRAME_OVERHEAD) > config.max_frame
        {
            return Err(Error::InvalidConfig(format!(
                "max_chunk {} does not fit in max_frame {}",
                config.max_chunk, config.max_frame
            )));
        }
        let listener = match config.listen {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };
        let (events, receiver) = mpsc::unbounded_channel();
        let handle = MeshHandle {
            config: Arc::new(config),
            events,
            shutdown: CancellationToken::new(),
        };
        let mut dispatcher = Dispatcher::new(handle.clone(), factories);
        for descriptor in handle.config().local_components() {
            if let Err(e) = dispatcher.create_component(descriptor.clone(), None) {
                dispatcher.shutdown();
                handle.shutdown();
                return Err(e);
            }
        }
        let mut dispatcher = OwnedJoinHandle {
            handle: tokio::spawn(dispatcher.run(receiver)),
        };
        for (name, instance, options) in components {
            if let Err(e) = handle.register(&name, instance, options).await {
                log::warn!("{} failed to start: {e}", handle.name());
                handle.shutdown();
                let _ = (&mut dispatcher.handle).await;
                return Err(e);
            }
        }
        if let Some(listener) = listener {
            log::info!("{} listening on {:?}", handle.name(), local_addr);
            tokio::spawn(node::listener::accept_loop(listener, handle.clone()));
        }
        for server in handle.config().servers.iter().cloned() {
            tokio::spawn(maintain::reconnect::dial_loop(handle.clone(), server));
        }
        tokio::spawn(maintain::route_refresh::route_refresh_loop(
            handle.clone(),
            handle.config().route_interval,
        ));
        Ok(Mesh {
            handle,
            local_addr,
            _dispatcher: dispatcher,
        })
    }
}
