//! The single owner of the node registry, the component registry and the
//! route table. Every mutation of those happens on the dispatcher task, one
//! event at a time.

use std::collections::HashMap;
use std::sync::Arc;

use meshlink_core::address::Address;
use meshlink_core::protocol::{ComponentDescriptor, ConnectContext, ErrorInfo, TunnelId, WireMessage};
use meshlink_core::route::{Route, RouteTable};
use meshlink_core::tunnel::TunnelWiring;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::component::{Component, ComponentContext, ComponentFactories, TunnelSet};
use crate::error::{Error, Result};
use crate::node::Link;
use crate::MeshHandle;

mod forward;
mod route_sync;

pub(crate) type EventSender = mpsc::UnboundedSender<Event>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub(crate) enum Event {
    /// A handshake completed; `accepted` is false for a duplicate name.
    LinkUp {
        link: Link,
        accepted: oneshot::Sender<bool>,
    },
    LinkDown {
        peer: String,
        link_id: u64,
        reason: String,
    },
    /// `regist` or `route` from a neighbour.
    Frame {
        peer: String,
        link_id: u64,
        message: WireMessage,
    },
    /// `tunnel::connect` from a neighbour; `done` fires once the tunnel is bound.
    Connect {
        peer: String,
        link_id: u64,
        id: TunnelId,
        address: Address,
        context: ConnectContext,
        done: oneshot::Sender<()>,
    },
    /// A locally originated tunnel.
    Open {
        wiring: TunnelWiring,
        address: Address,
        context: ConnectContext,
    },
    Register {
        descriptor: ComponentDescriptor,
        instance: Option<Arc<dyn Component>>,
        done: oneshot::Sender<Result<()>>,
    },
    Unregister {
        component: String,
        done: oneshot::Sender<bool>,
    },
    Disconnect {
        peer: String,
        done: oneshot::Sender<bool>,
    },
    Query(Query),
    RouteRefresh,
}

pub(crate) enum Query {
    Routes(oneshot::Sender<Vec<Route>>),
    Nodes(oneshot::Sender<Vec<String>>),
    Components(oneshot::Sender<Vec<Address>>),
    NextHop(String, oneshot::Sender<Option<String>>),
}

struct ComponentEntry {
    instance: Arc<dyn Component>,
    tunnels: TunnelSet,
    token: CancellationToken,
    /// The link whose peer asked for this component, if any.
    owner: Option<(String, u64)>,
}

pub(crate) struct Dispatcher {
    name: String,
    handle: MeshHandle,
    factories: ComponentFactories,
    nodes: HashMap<String, Link>,
    components: HashMap<String, ComponentEntry>,
    routes: RouteTable,
}

impl Dispatcher {
    pub(crate) fn new(handle: MeshHandle, factories: ComponentFactories) -> Self {
        let name = handle.name().to_string();
        let routes = RouteTable::new(name.clone(), handle.config().accept_policy);
        Self {
            name,
            handle,
            factories,
            nodes: HashMap::new(),
            components: HashMap::new(),
            routes,
        }
    }

    pub(crate) async fn run(mut self, mut events: EventReceiver) {
        let shutdown = self.handle.shutdown_token().clone();
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            self.handle_event(event);
        }
        self.shutdown();
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::LinkUp { link, accepted } => {
                let peer = link.peer.clone();
                let link_id = link.id;
                let ok = self.link_up(link);
                if accepted.send(ok).is_err() && ok {
                    self.link_down(&peer, link_id, "handshake abandoned");
                }
            }
            Event::LinkDown {
                peer,
                link_id,
                reason,
            } => self.link_down(&peer, link_id, &reason),
            Event::Frame {
                peer,
                link_id,
                message,
            } => {
                if !self.is_current(&peer, link_id) {
                    return;
                }
                match message {
                    WireMessage::Route(advert) => self.on_route(&peer, &advert),
                    WireMessage::Regist(descriptor) => self.on_regist(&peer, link_id, descriptor),
                    other => log::debug!("ignored {} from {peer}", other.name()),
                }
            }
            Event::Connect {
                peer,
                link_id,
                id,
                address,
                context,
                done,
            } => {
                if self.is_current(&peer, link_id) {
                    self.on_connect(&peer, id, address, context);
                }
                let _ = done.send(());
            }
            Event::Open {
                wiring,
                address,
                context,
            } => self.open(wiring, address, context),
            Event::Register {
                descriptor,
                instance,
                done,
            } => {
                let rs = match instance {
                    Some(instance) => self.register(descriptor, instance, None),
                    None => self.create_component(descriptor, None),
                };
                let _ = done.send(rs);
            }
            Event::Unregister { component, done } => {
                let _ = done.send(self.teardown_component(&component, None));
            }
            Event::Disconnect { peer, done } => {
                let found = match self.nodes.get(&peer) {
                    Some(link) => {
                        link.token.cancel();
                        true
                    }
                    None => false,
                };
                let _ = done.send(found);
            }
            Event::Query(query) => self.query(query),
            Event::RouteRefresh => self.refresh_routes(),
        }
    }

    fn query(&self, query: Query) {
        match query {
            Query::Routes(reply) => {
                let _ = reply.send(self.routes.routes());
            }
            Query::Nodes(reply) => {
                let mut nodes: Vec<String> = self.nodes.keys().cloned().collect();
                nodes.sort();
                let _ = reply.send(nodes);
            }
            Query::Components(reply) => {
                let mut components: Vec<Address> = self
                    .components
                    .keys()
                    .map(|name| Address::new(self.name.as_str(), name.as_str()))
                    .collect();
                components.sort();
                let _ = reply.send(components);
            }
            Query::NextHop(node, reply) => {
                let _ = reply.send(self.routes.find_next_hop(&node).map(str::to_string));
            }
        }
    }

    fn is_current(&self, peer: &str, link_id: u64) -> bool {
        self.nodes.get(peer).is_some_and(|link| link.id == link_id)
    }

    fn link_up(&mut self, link: Link) -> bool {
        if link.peer == self.name || self.nodes.contains_key(&link.peer) {
            return false;
        }
        let peer = link.peer.clone();
        self.nodes.insert(peer.clone(), link);
        self.on_neighbor_up(&peer);
        if let Some(link) = self.nodes.get(&peer) {
            for descriptor in self.handle.config().components_for(&peer) {
                log::debug!("asking {peer} to host {}", descriptor.name);
                let _ = link.sender.send(WireMessage::Regist(descriptor.clone()));
            }
        }
        true
    }

    fn link_down(&mut self, peer: &str, link_id: u64, reason: &str) {
        if !self.is_current(peer, link_id) {
            return;
        }
        if let Some(link) = self.nodes.remove(peer) {
            link.token.cancel();
        }
        log::info!("node {peer} disconnected: {reason}");
        let owned: Vec<String> = self
            .components
            .iter()
            .filter(|(_, entry)| {
                entry
                    .owner
                    .as_ref()
                    .is_some_and(|(owner, id)| owner == peer && *id == link_id)
            })
            .map(|(name, _)| name.clone())
            .collect();
        let error = ErrorInfo::new(format!("node {peer} disconnected"));
        for name in owned {
            self.teardown_component(&name, Some(error.clone()));
        }
        self.on_neighbor_down(peer);
    }

    fn on_regist(&mut self, peer: &str, link_id: u64, descriptor: ComponentDescriptor) {
        if !descriptor.name.is_on(&self.name) {
            log::warn!(
                "{peer} asked to host {} which is not on {}",
                descriptor.name,
                self.name
            );
            return;
        }
        let name = descriptor.name.clone();
        match self.create_component(descriptor, Some((peer.to_string(), link_id))) {
            Ok(()) => log::info!("create component {name} from {peer}"),
            Err(e) => log::warn!("regist {name} from {peer} failed: {e}"),
        }
    }

    pub(crate) fn create_component(
        &mut self,
        descriptor: ComponentDescriptor,
        owner: Option<(String, u64)>,
    ) -> Result<()> {
        if self.components.contains_key(descriptor.name.component()) {
            return Err(Error::ComponentExists(descriptor.name));
        }
        let instance = self.factories.create(&descriptor)?;
        self.register(descriptor, instance, owner)
    }

    fn register(
        &mut self,
        descriptor: ComponentDescriptor,
        instance: Arc<dyn Component>,
        owner: Option<(String, u64)>,
    ) -> Result<()> {
        let name = descriptor.name;
        if !name.is_on(&self.name) {
            return Err(Error::NoSuchComponent(name));
        }
        if self.components.contains_key(name.component()) {
            return Err(Error::ComponentExists(name));
        }
        let tunnels = TunnelSet::default();
        let token = self.handle.shutdown_token().child_token();
        let ctx = ComponentContext::new(
            name.clone(),
            self.handle.clone(),
            tunnels.clone(),
            token.clone(),
        );
        self.components.insert(
            name.component().to_string(),
            ComponentEntry {
                instance: instance.clone(),
                tunnels,
                token,
                owner,
            },
        );
        log::info!("component {name} registered");
        let closed = ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                rs = instance.on_ready(ctx) => {
                    if let Err(e) = rs {
                        log::warn!("component {name} failed to start: {e}");
                    }
                }
                _ = closed.closed() => {}
            }
        });
        Ok(())
    }

    /// Removes a component if it is still registered.
    fn teardown_component(&mut self, name: &str, error: Option<ErrorInfo>) -> bool {
        let Some(entry) = self.components.remove(name) else {
            return false;
        };
        log::info!("destroy component {}/{name}", self.name);
        entry.token.cancel();
        entry.tunnels.close_all(error.clone());
        entry.instance.on_close(error.as_ref());
        true
    }

    pub(crate) fn shutdown(&mut self) {
        log::info!("dispatcher of {} stopping", self.name);
        for link in self.nodes.values() {
            link.token.cancel();
        }
        self.nodes.clear();
        let names: Vec<String> = self.components.keys().cloned().collect();
        for name in names {
            self.teardown_component(&name, Some(Error::Shutdown.to_info()));
        }
    }
}
