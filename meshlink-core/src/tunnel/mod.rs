use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::{PollSemaphore, PollSender, WaitForCancellationFutureOwned};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::pipe::{Inlet, LinkSender, LinkTunnel, LinkTunnels};
use crate::protocol::{ErrorInfo, TunnelId, WireMessage};

mod control;

pub use control::{AckResult, CloseOrigin, CloseReason, Connecting, TunnelControl, TunnelState};

/// Largest chunk a single write moves across an in-process pair.
const PAIR_MAX_CHUNK: usize = 64 * 1024;

/// Upper bound on a tunnel's receive window, in chunks.
const MAX_WINDOW: usize = u16::MAX as usize;

/// One item of a tunnel's inbound byte stream.
#[derive(Debug)]
pub enum Segment {
    Data(Bytes),
    /// The peer finished writing.
    Final,
}

/// An out-of-band event sent alongside the byte stream.
#[derive(Clone, Debug, PartialEq)]
pub struct TunnelMessage {
    pub event: String,
    pub args: Vec<Value>,
}

/// Inbound side of a tunnel, held by whoever feeds it.
#[derive(Clone)]
pub struct TunnelInlet {
    segments: mpsc::Sender<Segment>,
    messages: mpsc::UnboundedSender<TunnelMessage>,
    /// Data frames the tunnel may still write to a link.
    credit: Arc<Semaphore>,
}

impl TunnelInlet {
    /// Queues a segment without waiting. Data beyond the receive window is
    /// refused with [`Error::WindowExceeded`].
    pub fn deliver(&self, id: TunnelId, segment: Segment) -> Result<()> {
        // the last slot is kept for `final`
        if matches!(segment, Segment::Data(_)) && self.segments.capacity() < 2 {
            return Err(Error::WindowExceeded(id));
        }
        self.segments.try_send(segment).map_err(|e| match e {
            TrySendError::Full(_) => Error::WindowExceeded(id),
            TrySendError::Closed(_) => Error::LinkClosed,
        })
    }
    /// Credit granted by the far end for this tunnel's outbound data.
    pub fn grant(&self, chunks: u32) {
        let room = Semaphore::MAX_PERMITS - self.credit.available_permits();
        self.credit.add_permits((chunks as usize).min(room));
    }
    pub fn deliver_message(&self, message: TunnelMessage) -> Result<()> {
        self.messages.send(message).map_err(|_| Error::LinkClosed)
    }
}

enum Outlet {
    Pair {
        segments: PollSender<Segment>,
        messages: mpsc::UnboundedSender<TunnelMessage>,
    },
    Link {
        id: TunnelId,
        link: LinkSender,
        permits: PollSemaphore,
        window: PollSemaphore,
        credit: Option<OwnedSemaphorePermit>,
    },
}

enum OutletSlot {
    Waiting(oneshot::Receiver<Outlet>),
    Ready(Outlet),
}

/// A logical byte stream between two components.
///
/// Reads return the peer's bytes in order, then EOF once the peer finished
/// writing, or an error if the tunnel was torn down with one. Writes wait for
/// the far side to drain. `shutdown` sends `final` once. Dropping the tunnel
/// destroys it.
pub struct Tunnel {
    control: TunnelControl,
    remote: Option<Address>,
    segments: mpsc::Receiver<Segment>,
    messages: mpsc::UnboundedReceiver<TunnelMessage>,
    last_buf: Option<Bytes>,
    read_eof: bool,
    outlet: OutletSlot,
    final_sent: bool,
    window: u32,
    /// Data segments read since credit was last returned.
    consumed: u32,
    read_cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    write_cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

/// The unbound ends of a fresh [`Tunnel`], used by whoever routes it.
pub struct TunnelWiring {
    control: TunnelControl,
    inlet: TunnelInlet,
    window: u32,
    outlet: oneshot::Sender<Outlet>,
}

impl Tunnel {
    /// Creates a tunnel whose inbound queue holds `capacity` chunks. Over a
    /// link that is also the window of data frames the peer may have in
    /// flight towards it.
    pub fn new(id: TunnelId, remote: Option<Address>, capacity: usize) -> (Tunnel, TunnelWiring) {
        let control = TunnelControl::new(id);
        let window = capacity.clamp(1, MAX_WINDOW);
        let (segment_sender, segment_receiver) = mpsc::channel(window + 1);
        let (message_sender, message_receiver) = mpsc::unbounded_channel();
        let (outlet_sender, outlet_receiver) = oneshot::channel();
        let token = control.cancellation_token();
        let tunnel = Tunnel {
            control: control.clone(),
            remote,
            segments: segment_receiver,
            messages: message_receiver,
            last_buf: None,
            read_eof: false,
            outlet: OutletSlot::Waiting(outlet_receiver),
            final_sent: false,
            window: window as u32,
            consumed: 0,
            read_cancelled: Box::pin(token.clone().cancelled_owned()),
            write_cancelled: Box::pin(token.cancelled_owned()),
        };
        let wiring = TunnelWiring {
            control,
            inlet: TunnelInlet {
                segments: segment_sender,
                messages: message_sender,
                credit: Arc::new(Semaphore::new(0)),
            },
            window: window as u32,
            outlet: outlet_sender,
        };
        (tunnel, wiring)
    }
    pub fn id(&self) -> TunnelId {
        self.control.id()
    }
    /// The address of the other end, when known.
    pub fn remote(&self) -> Option<&Address> {
        self.remote.as_ref()
    }
    pub fn state(&self) -> TunnelState {
        self.control.state()
    }
    pub fn control(&self) -> &TunnelControl {
        &self.control
    }
    pub fn destroy(&self, error: Option<ErrorInfo>) -> bool {
        self.control.destroy(error)
    }
    /// Sends an out-of-band event to the other end.
    pub fn send_message(&mut self, event: impl Into<String>, args: Vec<Value>) -> io::Result<()> {
        if self.control.is_closed() {
            return Err(closed_io_error(&self.control));
        }
        let message = TunnelMessage {
            event: event.into(),
            args,
        };
        let rs = match self.try_outlet() {
            Ok(Outlet::Pair { messages, .. }) => {
                messages.send(message).map_err(|_| Error::LinkClosed)
            }
            Ok(Outlet::Link { id, link, .. }) => link.send(WireMessage::Message {
                id: *id,
                event: message.event,
                args: message.args,
            }),
            Err(oneshot::error::TryRecvError::Empty) => {
                return Err(io::Error::from(io::ErrorKind::NotConnected))
            }
            Err(oneshot::error::TryRecvError::Closed) => Err(Error::LinkClosed),
        };
        rs.map_err(|_| closed_io_error(&self.control))
    }
    fn try_outlet(&mut self) -> Result<&Outlet, oneshot::error::TryRecvError> {
        if let OutletSlot::Waiting(receiver) = &mut self.outlet {
            let outlet = receiver.try_recv()?;
            self.outlet = OutletSlot::Ready(outlet);
        }
        match &self.outlet {
            OutletSlot::Ready(outlet) => Ok(outlet),
            OutletSlot::Waiting(_) => Err(oneshot::error::TryRecvError::Empty),
        }
    }
    /// Counts a consumed data segment. Credit goes back to the writer once
    /// half a window has been read.
    fn note_consumed(&mut self) {
        self.consumed += 1;
        if self.consumed < (self.window / 2).max(1) {
            return;
        }
        let chunks = self.consumed;
        match self.try_outlet() {
            Ok(Outlet::Link { id, link, .. }) => {
                let _ = link.send(WireMessage::Credit { id: *id, chunks });
            }
            Ok(Outlet::Pair { .. }) => {}
            Err(_) => return,
        }
        self.consumed = 0;
    }
    /// Next out-of-band event; `None` once the tunnel is closed.
    pub async fn next_message(&mut self) -> Option<TunnelMessage> {
        tokio::select! {
            biased;
            message = self.messages.recv() => message,
            _ = self.control.closed() => self.messages.try_recv().ok(),
        }
    }
    fn read_end(&mut self) -> io::Result<()> {
        if !self.read_eof {
            self.read_eof = true;
            self.control.finish_read();
        }
        match self.control.error() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

fn closed_io_error(control: &TunnelControl) -> io::Error {
    match control.error() {
        Some(error) => error.into(),
        None => io::Error::from(io::ErrorKind::BrokenPipe),
    }
}

fn poll_outlet<'a>(
    slot: &'a mut OutletSlot,
    cancelled: &mut Pin<Box<WaitForCancellationFutureOwned>>,
    control: &TunnelControl,
    cx: &mut Context<'_>,
) -> Poll<io::Result<&'a mut Outlet>> {
    if let OutletSlot::Waiting(receiver) = slot {
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(Ok(outlet)) => *slot = OutletSlot::Ready(outlet),
            Poll::Ready(Err(_)) => return Poll::Ready(Err(closed_io_error(control))),
            Poll::Pending => {
                if cancelled.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(closed_io_error(control)));
                }
                return Poll::Pending;
            }
        }
    }
    match slot {
        OutletSlot::Ready(outlet) => Poll::Ready(Ok(outlet)),
        OutletSlot::Waiting(_) => Poll::Pending,
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if let Some(p) = this.last_buf.as_mut() {
                let len = buf.remaining().min(p.len());
                buf.put_slice(&p[..len]);
                p.advance(len);
                if p.is_empty() {
                    this.last_buf.take();
                }
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(this.read_end());
            }
            match this.segments.poll_recv(cx) {
                Poll::Ready(Some(Segment::Data(p))) => {
                    this.note_consumed();
                    if !p.is_empty() {
                        this.last_buf.replace(p);
                    }
                }
                Poll::Ready(Some(Segment::Final)) | Poll::Ready(None) => {
                    return Poll::Ready(this.read_end());
                }
                Poll::Pending => {
                    if this.read_cancelled.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(this.read_end());
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.control.is_closed() {
            return Poll::Ready(Err(closed_io_error(&this.control)));
        }
        if this.final_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let outlet = ready!(poll_outlet(
            &mut this.outlet,
            &mut this.write_cancelled,
            &this.control,
            cx
        ))?;
        let poll = match outlet {
            Outlet::Pair { segments, .. } => match segments.poll_reserve(cx) {
                Poll::Ready(Ok(())) => {
                    let len = buf.len().min(PAIR_MAX_CHUNK);
                    match segments.send_item(Segment::Data(Bytes::copy_from_slice(&buf[..len]))) {
                        Ok(()) => Poll::Ready(Ok(len)),
                        Err(_) => Poll::Ready(Err(closed_io_error(&this.control))),
                    }
                }
                Poll::Ready(Err(_)) => Poll::Ready(Err(closed_io_error(&this.control))),
                Poll::Pending => Poll::Pending,
            },
            Outlet::Link {
                id,
                link,
                permits,
                window,
                credit,
            } => match poll_link_write(*id, link, permits, window, credit, cx, buf) {
                Poll::Ready(Ok(len)) => Poll::Ready(Ok(len)),
                Poll::Ready(Err(_)) => Poll::Ready(Err(closed_io_error(&this.control))),
                Poll::Pending => Poll::Pending,
            },
        };
        if poll.is_pending() && this.write_cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(closed_io_error(&this.control)));
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.final_sent {
            return Poll::Ready(Ok(()));
        }
        if this.control.is_closed() {
            return Poll::Ready(match this.control.error() {
                Some(error) => Err(error.into()),
                None => Ok(()),
            });
        }
        let outlet = ready!(poll_outlet(
            &mut this.outlet,
            &mut this.write_cancelled,
            &this.control,
            cx
        ))?;
        let rs = match outlet {
            Outlet::Pair { segments, .. } => match segments.poll_reserve(cx) {
                Poll::Ready(Ok(())) => segments.send_item(Segment::Final).map_err(|_| ()),
                Poll::Ready(Err(_)) => Err(()),
                Poll::Pending => {
                    if this.write_cancelled.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(closed_io_error(&this.control)));
                    }
                    return Poll::Pending;
                }
            },
            Outlet::Link { id, link, .. } => {
                link.send(WireMessage::Final { id: *id }).map_err(|_| ())
            }
        };
        if rs.is_err() {
            return Poll::Ready(Err(closed_io_error(&this.control)));
        }
        this.final_sent = true;
        this.control.finish_write();
        Poll::Ready(Ok(()))
    }
}

/// Writes one chunk of `buf` to a link once the peer has granted credit for
/// it and the link has budget for its bytes.
fn poll_link_write(
    id: TunnelId,
    link: &LinkSender,
    permits: &mut PollSemaphore,
    window: &mut PollSemaphore,
    credit: &mut Option<OwnedSemaphorePermit>,
    cx: &mut Context<'_>,
    buf: &[u8],
) -> Poll<Result<usize>> {
    if credit.is_none() {
        match ready!(window.poll_acquire(cx)) {
            Some(permit) => *credit = Some(permit),
            None => return Poll::Ready(Err(Error::LinkClosed)),
        }
    }
    let len = buf.len().min(link.max_chunk());
    match ready!(permits.poll_acquire_many(cx, len as u32)) {
        Some(permit) => permit.forget(),
        None => return Poll::Ready(Err(Error::LinkClosed)),
    }
    if let Some(permit) = credit.take() {
        permit.forget();
    }
    Poll::Ready(link.push_data(id, Bytes::copy_from_slice(&buf[..len])).map(|()| len))
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.control.destroy(None);
    }
}

impl TunnelWiring {
    pub fn id(&self) -> TunnelId {
        self.control.id()
    }
    pub fn control(&self) -> &TunnelControl {
        &self.control
    }
    pub fn inlet(&self) -> TunnelInlet {
        self.inlet.clone()
    }
    /// Data frames the far end may send before it hears back from us.
    pub fn window(&self) -> u32 {
        self.window
    }
    /// Cross-wires two in-process tunnels: writes on one are reads on the
    /// other, and closing either closes both.
    pub fn pair(self, other: TunnelWiring) {
        let _ = self.outlet.send(Outlet::Pair {
            segments: PollSender::new(other.inlet.segments.clone()),
            messages: other.inlet.messages.clone(),
        });
        let _ = other.outlet.send(Outlet::Pair {
            segments: PollSender::new(self.inlet.segments.clone()),
            messages: self.inlet.messages.clone(),
        });
        let peer = other.control.clone();
        self.control.on_close(move |reason| {
            peer.close(reason.error.clone(), CloseOrigin::Local);
        });
        let peer = self.control;
        other.control.on_close(move |reason| {
            peer.close(reason.error.clone(), CloseOrigin::Local);
        });
    }
    /// Binds the tunnel to a link: outbound bytes become wire events on
    /// `link`, inbound ones are found through `tunnels` by id. Nothing is
    /// written until the peer grants credit with `tunnel::credit`.
    pub fn bind_link(self, link: &LinkSender, tunnels: &LinkTunnels) {
        let id = self.control.id();
        let credit = self.inlet.credit.clone();
        tunnels.insert(
            id,
            LinkTunnel {
                inlet: Inlet::Local(self.inlet),
                control: self.control.clone(),
            },
        );
        let _ = self.outlet.send(Outlet::Link {
            id,
            link: link.clone(),
            permits: PollSemaphore::new(link.budget()),
            window: PollSemaphore::new(credit),
            credit: None,
        });
        watch_link(&self.control, link, tunnels);
    }
}

/// Removes the tunnel from `tunnels` when it closes, telling the peer with a
/// `tunnel::close` unless the close came from that peer.
fn watch_link(control: &TunnelControl, link: &LinkSender, tunnels: &LinkTunnels) {
    let id = control.id();
    let link = link.clone();
    let tunnels = tunnels.clone();
    control.on_close(move |reason| {
        tunnels.remove(&id);
        if reason.origin == CloseOrigin::Local {
            let _ = link.send(WireMessage::Close {
                id,
                error: reason.error.clone(),
            });
        }
    });
}

/// Joins the same tunnel id on two links so this node forwards it without
/// terminating it. Returns the controls for the upstream and downstream hops.
pub fn relay(
    id: TunnelId,
    upstream: (&LinkSender, &LinkTunnels),
    downstream: (&LinkSender, &LinkTunnels),
) -> (TunnelControl, TunnelControl) {
    let (up_link, up_tunnels) = upstream;
    let (down_link, down_tunnels) = downstream;
    let up = TunnelControl::new(id);
    let down = TunnelControl::new(id);
    up_tunnels.insert(
        id,
        LinkTunnel {
            inlet: Inlet::Relay(down_link.clone()),
            control: up.clone(),
        },
    );
    down_tunnels.insert(
        id,
        LinkTunnel {
            inlet: Inlet::Relay(up_link.clone()),
            control: down.clone(),
        },
    );
    watch_link(&up, up_link, up_tunnels);
    watch_link(&down, down_link, down_tunnels);
    let peer = down.clone();
    up.on_close(move |reason| {
        peer.close(reason.error.clone(), CloseOrigin::Local);
    });
    let peer = up.clone();
    down.on_close(move |reason| {
        peer.close(reason.error.clone(), CloseOrigin::Local);
    });
    (up, down)
}
