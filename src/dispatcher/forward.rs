//! The four forwarding paths.

use meshlink_core::address::Address;
use meshlink_core::protocol::{ConnectContext, ErrorInfo, TunnelId, WireMessage};
use meshlink_core::tunnel::{relay, CloseOrigin, Tunnel, TunnelControl, TunnelState, TunnelWiring};

use crate::component::Acknowledge;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::node::Link;

impl Dispatcher {
    /// Routes a tunnel a local component (or the embedding program) opened.
    pub(super) fn open(&mut self, wiring: TunnelWiring, address: Address, context: ConnectContext) {
        self.watch_connect_timeout(wiring.control());
        log::debug!("{} tunnel::connect {} -> {address}", self.name, wiring.id());
        if address.is_on(&self.name) {
            self.local_to_local(wiring, address, context);
            return;
        }
        match self.next_link(address.node()) {
            Some(link) => local_to_remote(wiring, address, context, &link),
            None => {
                let error = Error::NoRoute(address.node().to_string()).to_info();
                wiring.control().destroy(Some(error));
            }
        }
    }

    /// Handles `tunnel::connect` arriving from neighbour `peer`.
    pub(super) fn on_connect(
        &mut self,
        peer: &str,
        id: TunnelId,
        address: Address,
        context: ConnectContext,
    ) {
        let Some(from) = self.nodes.get(peer).cloned() else {
            return;
        };
        log::debug!("{} tunnel::connect {id} -> {address} from {peer}", self.name);
        if from.tunnels.contains_key(&id) {
            let error = ErrorInfo::new(format!("tunnel {id} already exists on {}", self.name));
            let _ = from.sender.send(WireMessage::Error { id, error });
            return;
        }
        if address.is_on(&self.name) {
            self.remote_to_local(&from, id, address, context);
            return;
        }
        match self.next_link(address.node()) {
            Some(next) if next.peer != from.peer => {
                remote_to_remote(&from, &next, id, address, context)
            }
            _ => {
                let error = Error::NoRoute(address.node().to_string())
                    .to_info()
                    .at(&self.name);
                let _ = from.sender.send(WireMessage::Error { id, error });
            }
        }
    }

    fn next_link(&self, node: &str) -> Option<Link> {
        let next = self.routes.find_next_hop(node)?;
        self.nodes.get(next).cloned()
    }

    fn local_to_local(&mut self, wiring: TunnelWiring, address: Address, context: ConnectContext) {
        let Some(entry) = self.components.get(address.component()) else {
            let error = Error::NoSuchComponent(address).to_info();
            wiring.control().destroy(Some(error));
            return;
        };
        let buffer = self.handle.config().tunnel_buffer;
        let (tunnel, partner) = Tunnel::new(TunnelId::random(), None, buffer);
        let origin = wiring.control().clone();
        let own = partner.control().clone();
        entry.tunnels.insert(&own);
        wiring.pair(partner);
        entry
            .instance
            .on_connection(tunnel, context, Acknowledge::pair(origin, own));
    }

    fn remote_to_local(&mut self, from: &Link, id: TunnelId, address: Address, context: ConnectContext) {
        let Some(entry) = self.components.get(address.component()) else {
            let error = Error::NoSuchComponent(address).to_info().at(&self.name);
            let _ = from.sender.send(WireMessage::Error { id, error });
            return;
        };
        let buffer = self.handle.config().tunnel_buffer;
        let (tunnel, wiring) = Tunnel::new(id, None, buffer);
        let own = wiring.control().clone();
        let window = wiring.window();
        wiring.bind_link(&from.sender, &from.tunnels);
        let _ = from.sender.send(WireMessage::Credit { id, chunks: window });
        entry.tunnels.insert(&own);
        entry
            .instance
            .on_connection(tunnel, context, Acknowledge::link(own, from.sender.clone()));
    }

    /// Fails a tunnel still opening after the connect timeout.
    fn watch_connect_timeout(&self, control: &TunnelControl) {
        let control = control.clone();
        let timeout = self.handle.config().connect_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = control.closed() => {}
                _ = tokio::time::sleep(timeout) => {
                    if control.state() == TunnelState::Opening {
                        control.destroy(Some(Error::Timeout("connect").to_info()));
                    }
                }
            }
        });
    }
}

fn local_to_remote(wiring: TunnelWiring, address: Address, context: ConnectContext, link: &Link) {
    let id = wiring.id();
    let control = wiring.control().clone();
    let window = wiring.window();
    // the inlet must exist before the peer can answer
    wiring.bind_link(&link.sender, &link.tunnels);
    let connect = WireMessage::Connect {
        id,
        address,
        context,
    };
    let rs = link
        .sender
        .send(connect)
        .and_then(|()| link.sender.send(WireMessage::Credit { id, chunks: window }));
    if rs.is_err() {
        control.destroy(Some(ErrorInfo::new(format!("link to {} closed", link.peer))));
    }
}

fn remote_to_remote(from: &Link, next: &Link, id: TunnelId, address: Address, context: ConnectContext) {
    if next.tunnels.contains_key(&id) {
        let error = ErrorInfo::new(format!("tunnel {id} loops through {}", next.peer));
        let _ = from.sender.send(WireMessage::Error { id, error });
        return;
    }
    log::debug!("relay {id} {} -> {} for {address}", from.peer, next.peer);
    let (_, down) = relay(
        id,
        (&from.sender, &from.tunnels),
        (&next.sender, &next.tunnels),
    );
    let connect = WireMessage::Connect {
        id,
        address,
        context,
    };
    if next.sender.send(connect).is_err() {
        down.close(
            Some(ErrorInfo::new(format!("link to {} closed", next.peer))),
            CloseOrigin::Remote,
        );
    }
}
