use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use meshlink_core::address::Address;
use meshlink_core::pipe::LinkSender;
use meshlink_core::protocol::{ComponentDescriptor, ConnectContext, ErrorInfo, TunnelId, WireMessage};
use meshlink_core::tunnel::{Connecting, Tunnel, TunnelControl};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::MeshHandle;

pub mod hole;
pub mod tcp;
pub mod through;

/// A protocol adapter hosted by a node.
///
/// `on_connection` is called on the dispatcher task and must not block:
/// move the tunnel into a spawned task.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Called once the component is registered.
    async fn on_ready(&self, _ctx: ComponentContext) -> Result<()> {
        Ok(())
    }
    /// An inbound tunnel addressed to this component.
    fn on_connection(&self, tunnel: Tunnel, context: ConnectContext, ack: Acknowledge);
    /// The component was removed, by request or because its owning link closed.
    fn on_close(&self, _error: Option<&ErrorInfo>) {}
}

/// What a component gets to talk back to the mesh.
#[derive(Clone)]
pub struct ComponentContext {
    name: Address,
    handle: MeshHandle,
    tunnels: TunnelSet,
    token: CancellationToken,
}

impl ComponentContext {
    pub(crate) fn new(
        name: Address,
        handle: MeshHandle,
        tunnels: TunnelSet,
        token: CancellationToken,
    ) -> Self {
        Self {
            name,
            handle,
            tunnels,
            token,
        }
    }
    pub fn name(&self) -> &Address {
        &self.name
    }
    pub fn handle(&self) -> &MeshHandle {
        &self.handle
    }
    /// Opens a tunnel owned by this component.
    pub fn connect(&self, address: Address, context: ConnectContext) -> (Tunnel, Connecting) {
        let (tunnel, connecting) = self.handle.connect(address, context);
        self.tunnels.insert(tunnel.control());
        (tunnel, connecting)
    }
    /// Cancelled when the component is torn down.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

enum AckTarget {
    /// In-process pair: the originator's control and ours.
    Pair {
        origin: TunnelControl,
        own: TunnelControl,
    },
    Link {
        own: TunnelControl,
        link: LinkSender,
    },
}

/// Completes the connect handshake of an inbound tunnel, exactly once.
/// Dropping it without a decision accepts with no arguments.
pub struct Acknowledge {
    target: Option<AckTarget>,
}

impl Acknowledge {
    pub(crate) fn pair(origin: TunnelControl, own: TunnelControl) -> Self {
        Self {
            target: Some(AckTarget::Pair { origin, own }),
        }
    }
    pub(crate) fn link(own: TunnelControl, link: LinkSender) -> Self {
        Self {
            target: Some(AckTarget::Link { own, link }),
        }
    }
    pub fn id(&self) -> Option<TunnelId> {
        match &self.target {
            Some(AckTarget::Pair { own, .. }) | Some(AckTarget::Link { own, .. }) => Some(own.id()),
            None => None,
        }
    }
    pub fn accept(mut self, args: Vec<Value>) {
        self.resolve(Ok(args))
    }
    pub fn reject(mut self, error: ErrorInfo) {
        self.resolve(Err(error))
    }
    fn resolve(&mut self, rs: Result<Vec<Value>, ErrorInfo>) {
        let Some(target) = self.target.take() else {
            return;
        };
        match (target, rs) {
            (AckTarget::Pair { origin, own }, Ok(args)) => {
                own.acknowledge(args.clone());
                origin.acknowledge(args);
            }
            (AckTarget::Link { own, link }, Ok(args)) => {
                if own.acknowledge(args.clone()) {
                    let _ = link.send(WireMessage::Connection { id: own.id(), args });
                }
            }
            (AckTarget::Pair { own, .. }, Err(error)) | (AckTarget::Link { own, .. }, Err(error)) => {
                own.destroy(Some(error));
            }
        }
    }
}

impl Drop for Acknowledge {
    fn drop(&mut self) {
        self.resolve(Ok(Vec::new()))
    }
}

impl fmt::Debug for Acknowledge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledge").field("id", &self.id()).finish()
    }
}

/// Tunnels a component originated or is serving. Entries leave the set
/// when their tunnel closes.
#[derive(Clone, Default)]
pub struct TunnelSet {
    inner: Arc<DashMap<TunnelId, TunnelControl>>,
}

impl TunnelSet {
    pub fn insert(&self, control: &TunnelControl) {
        let id = control.id();
        self.inner.insert(id, control.clone());
        let inner = self.inner.clone();
        control.on_close(move |_| {
            inner.remove(&id);
        });
    }
    pub fn len(&self) -> usize {
        self.inner.len()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
    pub fn close_all(&self, error: Option<ErrorInfo>) {
        let controls: Vec<TunnelControl> =
            self.inner.iter().map(|entry| entry.value().clone()).collect();
        for control in controls {
            control.destroy(error.clone());
        }
    }
}

pub type ComponentFactory =
    Arc<dyn Fn(&ComponentDescriptor) -> Result<Arc<dyn Component>> + Send + Sync>;

/// Component types by name.
#[derive(Clone)]
pub struct ComponentFactories {
    factories: HashMap<String, ComponentFactory>,
}

impl ComponentFactories {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
    pub fn insert(&mut self, kind: impl Into<String>, factory: ComponentFactory) {
        self.factories.insert(kind.into(), factory);
    }
    pub fn create(&self, descriptor: &ComponentDescriptor) -> Result<Arc<dyn Component>> {
        let factory = self.factories.get(&descriptor.kind).ok_or_else(|| {
            Error::UnsupportedComponent {
                kind: descriptor.kind.clone(),
                name: descriptor.name.clone(),
            }
        })?;
        factory(descriptor)
    }
}

impl Default for ComponentFactories {
    fn default() -> Self {
        let mut factories = Self::empty();
        factories.insert("hole", Arc::new(hole::Hole::create));
        factories.insert("through", Arc::new(through::Through::create));
        factories.insert("tcp", Arc::new(tcp::TcpComponent::create));
        factories
    }
}

/// Parses the adapter-specific options of a descriptor.
pub(crate) fn parse_options<T: DeserializeOwned>(descriptor: &ComponentDescriptor) -> Result<T> {
    let options = match &descriptor.options {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(options).map_err(|e| Error::InvalidOptions {
        name: descriptor.name.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use meshlink_core::tunnel::{CloseOrigin, TunnelState};

    #[test]
    fn tunnel_set_forgets_closed_tunnels() {
        let set = TunnelSet::default();
        let a = TunnelControl::new(TunnelId::from_u64(1));
        let b = TunnelControl::new(TunnelId::from_u64(2));
        set.insert(&a);
        set.insert(&b);
        a.close(None, CloseOrigin::Remote);
        assert_eq!(set.len(), 1);
        set.close_all(Some(ErrorInfo::new("component closed")));
        assert!(set.is_empty());
        assert_eq!(b.error().unwrap().message, "component closed");
    }

    #[tokio::test]
    async fn dropped_acknowledge_accepts() {
        let origin = TunnelControl::new(TunnelId::from_u64(3));
        let own = TunnelControl::new(TunnelId::from_u64(3));
        let connecting = origin.connecting();
        drop(Acknowledge::pair(origin.clone(), own.clone()));
        assert_eq!(connecting.await.unwrap(), Vec::<Value>::new());
        assert_eq!(own.state(), TunnelState::Open);
    }

    #[tokio::test]
    async fn rejected_link_connect_sends_one_close() {
        let (link, mut queue) = meshlink_core::pipe::link_channel("peer", 64, 16);
        let own = TunnelControl::new(TunnelId::from_u64(4));
        let tunnels: meshlink_core::pipe::LinkTunnels = Default::default();
        let (tunnel, wiring) = Tunnel::new(own.id(), None, 4);
        let own = wiring.control().clone();
        wiring.bind_link(&link, &tunnels);
        Acknowledge::link(own, link.clone()).reject(ErrorInfo::new("busy"));
        drop(tunnel);
        drop(link);
        match queue.recv().await.unwrap().message {
            WireMessage::Close { error, .. } => assert_eq!(error.unwrap().message, "busy"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(queue.recv().await.is_none());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let descriptor = ComponentDescriptor::new("n1/x".parse().unwrap(), "vless");
        let err = ComponentFactories::default().create(&descriptor).err().unwrap();
        assert!(matches!(err, Error::UnsupportedComponent { .. }));
    }
}
