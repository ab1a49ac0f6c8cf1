//! Accepts every tunnel and discards what it carries.

use std::sync::Arc;

use meshlink_core::protocol::{ComponentDescriptor, ConnectContext};
use meshlink_core::tunnel::Tunnel;

use crate::component::{Acknowledge, Component};
use crate::error::Result;

pub struct Hole;

impl Hole {
    pub fn create(_descriptor: &ComponentDescriptor) -> Result<Arc<dyn Component>> {
        Ok(Arc::new(Hole))
    }
}

#[async_trait::async_trait]
impl Component for Hole {
    fn on_connection(&self, mut tunnel: Tunnel, context: ConnectContext, ack: Acknowledge) {
        log::debug!("hole swallows {} from {:?}", tunnel.id(), context.source);
        ack.accept(Vec::new());
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut tunnel, &mut tokio::io::sink()).await;
        });
    }
}
