//! Forwards every inbound tunnel to another address.

use std::sync::Arc;

use meshlink_core::address::Address;
use meshlink_core::protocol::{ComponentDescriptor, ConnectContext, ErrorInfo};
use meshlink_core::tunnel::Tunnel;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::component::{parse_options, Acknowledge, Component, ComponentContext};
use crate::error::Result;

#[derive(Deserialize)]
struct ThroughOptions {
    pass: Address,
}

pub struct Through {
    name: Address,
    pass: Address,
    ctx: Mutex<Option<ComponentContext>>,
}

impl Through {
    pub fn create(descriptor: &ComponentDescriptor) -> Result<Arc<dyn Component>> {
        let options: ThroughOptions = parse_options(descriptor)?;
        Ok(Arc::new(Through {
            name: descriptor.name.clone(),
            pass: options.pass,
            ctx: Mutex::new(None),
        }))
    }
}

#[async_trait::async_trait]
impl Component for Through {
    async fn on_ready(&self, ctx: ComponentContext) -> Result<()> {
        self.ctx.lock().replace(ctx);
        Ok(())
    }

    fn on_connection(&self, mut inbound: Tunnel, context: ConnectContext, ack: Acknowledge) {
        let Some(ctx) = self.ctx.lock().clone() else {
            ack.reject(ErrorInfo::new(format!("{} is not ready", self.name)));
            return;
        };
        let (mut outbound, connecting) = ctx.connect(self.pass.clone(), context);
        let pass = self.pass.clone();
        tokio::spawn(async move {
            match connecting.await {
                Ok(args) => ack.accept(args),
                Err(error) => {
                    log::debug!("through {pass} failed: {error}");
                    ack.reject(error);
                    return;
                }
            }
            if let Err(e) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
                log::debug!("through {pass} ended: {e}");
            }
        });
    }
}
