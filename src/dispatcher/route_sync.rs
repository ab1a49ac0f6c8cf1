//! Distance-vector convergence with the neighbours.

use std::collections::BTreeMap;

use meshlink_core::protocol::WireMessage;
use meshlink_core::route::RouteAdvert;

use crate::dispatcher::Dispatcher;

impl Dispatcher {
    pub(super) fn on_neighbor_up(&mut self, peer: &str) {
        self.routes.add_direct(peer);
        self.advertise_to(peer);
        self.broadcast_routes(Some(peer));
    }

    pub(super) fn on_neighbor_down(&mut self, peer: &str) {
        let withdrawn = self.routes.withdraw(peer);
        if !withdrawn.is_empty() {
            log::debug!("{} withdrew {withdrawn:?} after {peer} left", self.name);
            self.broadcast_routes(None);
        }
    }

    pub(super) fn on_route(&mut self, peer: &str, advert: &BTreeMap<String, RouteAdvert>) {
        let nodes = &self.nodes;
        let changed = self
            .routes
            .merge(peer, advert, |destination| nodes.contains_key(destination));
        if !changed.is_empty() {
            log::debug!("{} learned {changed:?} from {peer}", self.name);
            self.broadcast_routes(Some(peer));
        }
    }

    /// Re-advertises the whole table, then forgets unreachable routes.
    pub(super) fn refresh_routes(&mut self) {
        self.broadcast_routes(None);
        let purged = self.routes.purge_unreachable();
        if purged > 0 {
            log::debug!("{} purged {purged} unreachable routes", self.name);
        }
    }

    fn advertise_to(&self, peer: &str) {
        if let Some(link) = self.nodes.get(peer) {
            let advert = self.routes.advertisement_for(peer);
            let _ = link.sender.send(WireMessage::Route(advert));
        }
    }

    fn broadcast_routes(&self, except: Option<&str>) {
        for peer in self.nodes.keys() {
            if Some(peer.as_str()) != except {
                self.advertise_to(peer);
            }
        }
    }
}
