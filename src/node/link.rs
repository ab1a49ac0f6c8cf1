use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use meshlink_core::error::Error as CoreError;
use meshlink_core::pipe::{
    link_channel, FramedReader, FramedWriter, Inlet, LinkQueue, LinkSender, LinkTunnels,
};
use meshlink_core::protocol::{ErrorInfo, TunnelId, WireMessage};
use meshlink_core::tunnel::{CloseOrigin, Segment, TunnelControl, TunnelMessage};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Event;
use crate::error::{Error, Result};
use crate::MeshHandle;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// One authenticated physical connection to a neighbour.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) id: u64,
    pub(crate) peer: String,
    pub(crate) sender: LinkSender,
    pub(crate) tunnels: LinkTunnels,
    /// Cancelled when the link goes down, from either side.
    pub(crate) token: CancellationToken,
}

impl Link {
    pub(crate) fn new(peer: &str, handle: &MeshHandle) -> (Link, LinkQueue) {
        let config = handle.config();
        let (sender, queue) = link_channel(peer, config.link_budget, config.max_chunk);
        let link = Link {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.to_string(),
            sender,
            tunnels: Arc::new(DashMap::new()),
            token: handle.shutdown_token().child_token(),
        };
        (link, queue)
    }
    fn lookup(&self, id: TunnelId) -> Option<(Inlet, TunnelControl)> {
        self.tunnels
            .get(&id)
            .map(|entry| (entry.inlet.clone(), entry.control.clone()))
    }
    /// Hands a segment to its tunnel without waiting. A peer that ignores
    /// the tunnel's window loses that tunnel.
    fn deliver(&self, id: TunnelId, segment: Segment) {
        let Some((inlet, control)) = self.lookup(id) else {
            log::trace!("{} from {} for unknown tunnel {id}", segment_name(&segment), self.peer);
            return;
        };
        match inlet.deliver(id, segment) {
            Ok(()) => {}
            Err(CoreError::WindowExceeded(_)) => {
                log::warn!("tunnel {id} from {} overran its window", self.peer);
                let error = ErrorInfo::new(format!("tunnel {id} overran its window"));
                control.close(Some(error), CloseOrigin::Local);
            }
            Err(e) => log::debug!("tunnel {id} dropped inbound data: {e}"),
        }
    }
    /// Closes every tunnel carried by this link.
    fn teardown(&self, reason: &str) {
        self.token.cancel();
        self.sender.close();
        let controls: Vec<TunnelControl> = self
            .tunnels
            .iter()
            .map(|entry| entry.control.clone())
            .collect();
        if !controls.is_empty() {
            log::debug!("closing {} tunnels carried by {}", controls.len(), self.peer);
        }
        let error = ErrorInfo::new(format!("link to {} closed: {reason}", self.peer));
        for control in controls {
            control.close(Some(error.clone()), CloseOrigin::Remote);
        }
    }
}

fn segment_name(segment: &Segment) -> &'static str {
    match segment {
        Segment::Data(_) => "tunnel::data",
        Segment::Final => "tunnel::final",
    }
}

pub(crate) async fn write_loop(link: Link, mut queue: LinkQueue, mut writer: FramedWriter) {
    loop {
        let frame = tokio::select! {
            _ = link.token.cancelled() => break,
            frame = queue.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        let rs = tokio::select! {
            _ = link.token.cancelled() => break,
            rs = writer.send(&frame.message) => rs,
        };
        queue.release(&frame);
        if let Err(e) = rs {
            log::warn!("write to {} failed: {e}", link.peer);
            break;
        }
    }
    link.token.cancel();
    queue.close();
    let _ = writer.shutdown().await;
}

pub(crate) async fn read_loop(link: Link, mut reader: FramedReader, handle: MeshHandle) {
    let idle_timeout = handle.config().idle_timeout;
    let reason = loop {
        let rs = tokio::select! {
            _ = link.token.cancelled() => break "closed locally".to_string(),
            rs = tokio::time::timeout(idle_timeout, reader.next()) => rs,
        };
        let message = match rs {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                log::warn!("read from {} failed: {e}", link.peer);
                break e.to_string();
            }
            Err(_) => {
                log::warn!("link to {} idle for {idle_timeout:?}", link.peer);
                break "idle timeout".to_string();
            }
        };
        if let Err(e) = handle_message(&link, message, &handle).await {
            log::warn!("link to {}: {e}", link.peer);
            break e.to_string();
        }
    };
    link.teardown(&reason);
    log::info!("link to {} is down id={} reason={reason}", link.peer, link.id);
    let _ = handle.send(Event::LinkDown {
        peer: link.peer.clone(),
        link_id: link.id,
        reason,
    });
}

async fn handle_message(link: &Link, message: WireMessage, handle: &MeshHandle) -> Result<()> {
    match message {
        WireMessage::Ping { timestamp } => {
            link.sender.send(WireMessage::Pong { timestamp })?;
        }
        WireMessage::Pong { .. } => {}
        WireMessage::Data { id, chunk } => link.deliver(id, Segment::Data(chunk)),
        WireMessage::Final { id } => link.deliver(id, Segment::Final),
        WireMessage::Credit { id, chunks } => {
            if let Some((inlet, _)) = link.lookup(id) {
                let _ = inlet.grant(id, chunks);
            }
        }
        WireMessage::Connection { id, args } => {
            if let Some((inlet, control)) = link.lookup(id) {
                control.acknowledge(args.clone());
                if let Inlet::Relay(next) = inlet {
                    let _ = next.send(WireMessage::Connection { id, args });
                }
            }
        }
        WireMessage::Error { id, error } => {
            if let Some((_, control)) = link.lookup(id) {
                control.close(Some(error), CloseOrigin::Remote);
            }
        }
        WireMessage::Close { id, error } => {
            if let Some((_, control)) = link.lookup(id) {
                control.close(error, CloseOrigin::Remote);
            }
        }
        WireMessage::Message { id, event, args } => {
            if let Some((inlet, _)) = link.lookup(id) {
                let _ = inlet.deliver_message(id, TunnelMessage { event, args });
            }
        }
        WireMessage::Connect {
            id,
            address,
            context,
        } => {
            let (done, wait) = oneshot::channel();
            handle
                .send(Event::Connect {
                    peer: link.peer.clone(),
                    link_id: link.id,
                    id,
                    address,
                    context,
                    done,
                })
                .map_err(|_| Error::Shutdown)?;
            // the inlet for `id` exists before the next frame is read
            tokio::select! {
                _ = wait => {}
                _ = link.token.cancelled() => {}
            }
        }
        message @ (WireMessage::Regist(_) | WireMessage::Route(_)) => {
            handle
                .send(Event::Frame {
                    peer: link.peer.clone(),
                    link_id: link.id,
                    message,
                })
                .map_err(|_| Error::Shutdown)?;
        }
        WireMessage::Auth { .. } | WireMessage::AuthOk { .. } | WireMessage::AuthFailed => {
            return Err(Error::Protocol(format!(
                "unexpected {} after handshake",
                message.name()
            )));
        }
    }
    Ok(())
}
