use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};

use crate::error::{Error, Result};
use crate::protocol::{TunnelId, WireMessage};
use crate::tunnel::{Segment, TunnelControl, TunnelInlet, TunnelMessage};

/// A queued outbound message plus the byte budget it holds.
#[derive(Debug)]
pub struct Frame {
    pub message: WireMessage,
    permits: usize,
}

impl Frame {
    pub fn permits(&self) -> usize {
        self.permits
    }
}

/// Ordered send side of one physical link.
///
/// Control messages are never blocked. Data written by local tunnels holds a
/// share of a byte budget until the writer task has put it on the wire, so a
/// slow link pushes back on every tunnel writing into it. Relayed data is not
/// budgeted: the end-to-end credit window already bounds it.
#[derive(Clone)]
pub struct LinkSender {
    peer: Arc<str>,
    sender: mpsc::UnboundedSender<Frame>,
    budget: Arc<Semaphore>,
    max_chunk: usize,
}

pub struct LinkQueue {
    receiver: mpsc::UnboundedReceiver<Frame>,
    budget: Arc<Semaphore>,
}

pub fn link_channel(peer: &str, budget: usize, max_chunk: usize) -> (LinkSender, LinkQueue) {
    let budget = budget.clamp(1, Semaphore::MAX_PERMITS);
    let max_chunk = max_chunk.clamp(1, budget).min(u32::MAX as usize);
    let (sender, receiver) = mpsc::unbounded_channel();
    let budget = Arc::new(Semaphore::new(budget));
    (
        LinkSender {
            peer: peer.into(),
            sender,
            budget: budget.clone(),
            max_chunk,
        },
        LinkQueue { receiver, budget },
    )
}

impl LinkSender {
    pub fn peer(&self) -> &str {
        &self.peer
    }
    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }
    pub fn send(&self, message: WireMessage) -> Result<()> {
        self.sender
            .send(Frame {
                message,
                permits: 0,
            })
            .map_err(|_| Error::LinkClosed)
    }
    /// Queues a chunk whose budget the caller already acquired and forgot.
    pub(crate) fn push_data(&self, id: TunnelId, chunk: Bytes) -> Result<()> {
        let permits = chunk.len();
        self.sender
            .send(Frame {
                message: WireMessage::Data { id, chunk },
                permits,
            })
            .map_err(|_| {
                self.budget.add_permits(permits);
                Error::LinkClosed
            })
    }
    pub(crate) fn budget(&self) -> Arc<Semaphore> {
        self.budget.clone()
    }
    /// Fails every pending and future data send.
    pub fn close(&self) {
        self.budget.close();
    }
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.budget.is_closed()
    }
    pub fn same_link(&self, other: &LinkSender) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

impl LinkQueue {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }
    /// Returns the budget held by a frame that has been written.
    pub fn release(&self, frame: &Frame) {
        if frame.permits > 0 {
            self.budget.add_permits(frame.permits);
        }
    }
    pub fn close(&mut self) {
        self.budget.close();
        self.receiver.close();
    }
}

/// Where inbound traffic for one tunnel on a link is delivered.
#[derive(Clone)]
pub enum Inlet {
    /// A tunnel terminating on this node.
    Local(TunnelInlet),
    /// The other half of a relay, on another link.
    Relay(LinkSender),
}

impl Inlet {
    /// Delivers a segment without waiting. A local tunnel that is already
    /// holding its whole window fails with [`Error::WindowExceeded`].
    pub fn deliver(&self, id: TunnelId, segment: Segment) -> Result<()> {
        match self {
            Inlet::Local(inlet) => inlet.deliver(id, segment),
            Inlet::Relay(link) => match segment {
                Segment::Data(chunk) => link.send(WireMessage::Data { id, chunk }),
                Segment::Final => link.send(WireMessage::Final { id }),
            },
        }
    }
    /// Lets the tunnel's writer send `chunks` more data frames.
    pub fn grant(&self, id: TunnelId, chunks: u32) -> Result<()> {
        match self {
            Inlet::Local(inlet) => {
                inlet.grant(chunks);
                Ok(())
            }
            Inlet::Relay(link) => link.send(WireMessage::Credit { id, chunks }),
        }
    }
    pub fn deliver_message(&self, id: TunnelId, message: TunnelMessage) -> Result<()> {
        match self {
            Inlet::Local(inlet) => inlet.deliver_message(message),
            Inlet::Relay(link) => link.send(WireMessage::Message {
                id,
                event: message.event,
                args: message.args,
            }),
        }
    }
}

pub struct LinkTunnel {
    pub inlet: Inlet,
    pub control: TunnelControl,
}

/// Tunnels currently bound to one link, by id.
pub type LinkTunnels = Arc<DashMap<TunnelId, LinkTunnel>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn push(sender: &LinkSender, id: TunnelId, chunk: &'static [u8]) {
        sender
            .budget()
            .try_acquire_many(chunk.len() as u32)
            .unwrap()
            .forget();
        sender.push_data(id, Bytes::from_static(chunk)).unwrap();
    }

    #[tokio::test]
    async fn written_frames_return_their_budget() {
        let (sender, mut queue) = link_channel("peer", 8, 4);
        let id = TunnelId::from_u64(1);
        push(&sender, id, b"abcd");
        push(&sender, id, b"efgh");
        assert_eq!(sender.budget().available_permits(), 0);
        let frame = queue.recv().await.unwrap();
        assert_eq!(frame.permits(), 4);
        queue.release(&frame);
        assert_eq!(sender.budget().available_permits(), 4);
    }

    #[tokio::test]
    async fn control_is_not_budgeted() {
        let (sender, mut queue) = link_channel("peer", 1, 1);
        let id = TunnelId::from_u64(2);
        push(&sender, id, b"x");
        sender.send(WireMessage::Final { id }).unwrap();
        assert!(matches!(
            queue.recv().await.unwrap().message,
            WireMessage::Data { .. }
        ));
        assert_eq!(queue.recv().await.unwrap().message, WireMessage::Final { id });
    }

    #[tokio::test]
    async fn closed_link_fails_writers() {
        let (sender, mut queue) = link_channel("peer", 1, 1);
        let id = TunnelId::from_u64(3);
        push(&sender, id, b"x");
        queue.close();
        assert!(sender.budget().try_acquire_many(1).is_err());
        assert!(sender.push_data(id, Bytes::from_static(b"y")).is_err());
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn relay_inlet_forwards_without_waiting() {
        let (sender, mut queue) = link_channel("next", 1, 1);
        let id = TunnelId::from_u64(4);
        let inlet = Inlet::Relay(sender);
        inlet
            .deliver(id, Segment::Data(Bytes::from_static(b"larger than the budget")))
            .unwrap();
        inlet.grant(id, 3).unwrap();
        inlet.deliver(id, Segment::Final).unwrap();
        let frame = queue.recv().await.unwrap();
        assert_eq!(frame.permits(), 0);
        assert_eq!(
            frame.message,
            WireMessage::Data {
                id,
                chunk: Bytes::from_static(b"larger than the budget")
            }
        );
        assert_eq!(
            queue.recv().await.unwrap().message,
            WireMessage::Credit { id, chunks: 3 }
        );
        assert_eq!(queue.recv().await.unwrap().message, WireMessage::Final { id });
    }
}
