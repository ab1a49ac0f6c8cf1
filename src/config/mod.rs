use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use meshlink_core::pipe::DEFAULT_MAX_FRAME;
use meshlink_core::protocol::ComponentDescriptor;
use meshlink_core::route::AcceptPolicy;

pub(crate) const TUNNEL_BUFFER: usize = 32;
pub(crate) const LINK_BUDGET: usize = 4 * 1024 * 1024;
pub(crate) const MAX_CHUNK: usize = 64 * 1024;

/// An outbound peer the node keeps a link to.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub name: String,
    /// `host:port`, optionally prefixed with `tcp://`.
    pub addr: String,
    pub token: String,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            token: token.into(),
        }
    }
    pub(crate) fn socket_addr(&self) -> &str {
        self.addr.strip_prefix("tcp://").unwrap_or(&self.addr)
    }
}

pub struct MeshConfig {
    pub name: String,
    pub listen: Option<SocketAddr>,
    pub servers: Vec<ServerConfig>,
    pub components: Vec<ComponentDescriptor>,
    /// Peer name to shared token, checked on inbound handshakes.
    pub auth: HashMap<String, String>,
    pub tunnel_buffer: usize,
    pub link_budget: usize,
    pub max_chunk: usize,
    pub max_frame: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub route_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub accept_policy: AcceptPolicy,
}

impl MeshConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen: None,
            servers: Vec::new(),
            components: Vec::new(),
            auth: HashMap::new(),
            tunnel_buffer: TUNNEL_BUFFER,
            link_budget: LINK_BUDGET,
            max_chunk: MAX_CHUNK,
            max_frame: DEFAULT_MAX_FRAME,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(15),
            route_interval: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            accept_policy: AcceptPolicy::default(),
        }
    }
    pub fn set_listen(mut self, listen: SocketAddr) -> Self {
        self.listen.replace(listen);
        self
    }
    pub fn add_server(mut self, server: ServerConfig) -> Self {
        self.servers.push(server);
        self
    }
    pub fn add_component(mut self, component: ComponentDescriptor) -> Self {
        self.components.push(component);
        self
    }
    pub fn add_auth(mut self, peer: impl Into<String>, token: impl Into<String>) -> Self {
        self.auth.insert(peer.into(), token.into());
        self
    }
    pub fn set_tunnel_buffer(mut self, tunnel_buffer: usize) -> Self {
        self.tunnel_buffer = tunnel_buffer;
        self
    }
    pub fn set_link_budget(mut self, link_budget: usize) -> Self {
        self.link_budget = link_budget;
        self
    }
    pub fn set_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk;
        self
    }
    pub fn set_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }
    pub fn set_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
    pub fn set_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
    pub fn set_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }
    pub fn set_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
    pub fn set_route_interval(mut self, route_interval: Duration) -> Self {
        self.route_interval = route_interval;
        self
    }
    pub fn set_reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max;
        self
    }
    pub fn set_accept_policy(mut self, accept_policy: AcceptPolicy) -> Self {
        self.accept_policy = accept_policy;
        self
    }
    /// Components this node hosts itself.
    pub(crate) fn local_components(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.components
            .iter()
            .filter(move |c| c.name.node() == self.name)
    }
    /// Components to ask `peer` to host once a link to it is up.
    pub(crate) fn components_for<'a>(
        &'a self,
        peer: &'a str,
    ) -> impl Iterator<Item = &'a ComponentDescriptor> {
        self.components
            .iter()
            .filter(move |c| c.name.node() == peer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn components_are_split_by_node() {
        let config = MeshConfig::new("n1")
            .add_component(ComponentDescriptor::new("n1/a".parse().unwrap(), "hole"))
            .add_component(ComponentDescriptor::new("n2/b".parse().unwrap(), "hole"))
            .add_component(ComponentDescriptor::new("n2/c".parse().unwrap(), "hole"));
        assert_eq!(config.local_components().count(), 1);
        assert_eq!(config.components_for("n2").count(), 2);
        assert_eq!(config.components_for("n3").count(), 0);
    }

    #[test]
    fn server_addr_accepts_scheme() {
        let server = ServerConfig::new("n2", "tcp://127.0.0.1:23333", "t");
        assert_eq!(server.socket_addr(), "127.0.0.1:23333");
    }
}
