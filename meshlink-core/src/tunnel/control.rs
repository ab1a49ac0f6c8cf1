use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ErrorInfo, TunnelId};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TunnelState {
    /// Connect requested, not yet acknowledged.
    Opening,
    Open,
    /// The local side finished writing.
    ReadOnly,
    /// The peer finished writing.
    WriteOnly,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Opening => "opening",
            TunnelState::Open => "open",
            TunnelState::ReadOnly => "read-only",
            TunnelState::WriteOnly => "write-only",
            TunnelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side triggered the teardown.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloseOrigin {
    Local,
    /// A `tunnel::close` or `tunnel::error` arrived from the link.
    Remote,
}

#[derive(Clone, Debug)]
pub struct CloseReason {
    pub error: Option<ErrorInfo>,
    pub origin: CloseOrigin,
}

/// Arguments a connect was acknowledged with, or why it failed.
pub type AckResult = Result<Vec<Value>, ErrorInfo>;

type CloseHook = Box<dyn FnOnce(&CloseReason) + Send>;

#[derive(Default)]
struct Flags {
    opened: bool,
    write_done: bool,
    read_done: bool,
    reason: Option<CloseReason>,
}

struct Inner {
    id: TunnelId,
    flags: Mutex<Flags>,
    hooks: Mutex<Vec<CloseHook>>,
    ack: Mutex<Option<oneshot::Sender<AckResult>>>,
    token: CancellationToken,
}

/// Shared lifecycle of one tunnel endpoint.
///
/// Cheap to clone. Teardown happens exactly once no matter how many paths
/// race to trigger it: the first caller of [`TunnelControl::close`] wins, the
/// close hooks run once, and everyone else gets `false`.
#[derive(Clone)]
pub struct TunnelControl {
    inner: Arc<Inner>,
}

impl TunnelControl {
    pub fn new(id: TunnelId) -> TunnelControl {
        Self {
            inner: Arc::new(Inner {
                id,
                flags: Mutex::new(Flags::default()),
                hooks: Mutex::new(Vec::new()),
                ack: Mutex::new(None),
                token: CancellationToken::new(),
            }),
        }
    }
    pub fn id(&self) -> TunnelId {
        self.inner.id
    }
    pub fn state(&self) -> TunnelState {
        let flags = self.inner.flags.lock();
        if flags.reason.is_some() {
            return TunnelState::Closed;
        }
        if !flags.opened {
            return TunnelState::Opening;
        }
        match (flags.write_done, flags.read_done) {
            (false, false) => TunnelState::Open,
            (true, false) => TunnelState::ReadOnly,
            (false, true) => TunnelState::WriteOnly,
            (true, true) => TunnelState::Closed,
        }
    }
    pub fn is_closed(&self) -> bool {
        self.inner.flags.lock().reason.is_some()
    }
    pub fn reason(&self) -> Option<CloseReason> {
        self.inner.flags.lock().reason.clone()
    }
    pub fn error(&self) -> Option<ErrorInfo> {
        self.inner
            .flags
            .lock()
            .reason
            .as_ref()
            .and_then(|reason| reason.error.clone())
    }
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }
    /// Resolves once the tunnel is closed.
    pub async fn closed(&self) {
        self.inner.token.cancelled().await
    }
    /// Runs `hook` when the tunnel closes, or right away if it already has.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce(&CloseReason) + Send + 'static,
    {
        let mut hooks = self.inner.hooks.lock();
        let reason = self.inner.flags.lock().reason.clone();
        match reason {
            Some(reason) => {
                drop(hooks);
                hook(&reason);
            }
            None => hooks.push(Box::new(hook)),
        }
    }
    /// Creates the future that resolves with the connect acknowledgement.
    pub fn connecting(&self) -> Connecting {
        let (sender, receiver) = oneshot::channel();
        if let Some(reason) = self.reason() {
            let _ = sender.send(Err(closed_error(reason.error)));
        } else {
            *self.inner.ack.lock() = Some(sender);
        }
        Connecting { receiver }
    }
    /// Moves an opening tunnel to open and resolves [`Connecting`].
    pub fn acknowledge(&self, args: Vec<Value>) -> bool {
        {
            let mut flags = self.inner.flags.lock();
            if flags.opened || flags.reason.is_some() {
                return false;
            }
            flags.opened = true;
        }
        if let Some(ack) = self.inner.ack.lock().take() {
            let _ = ack.send(Ok(args));
        }
        true
    }
    /// Records that no more data will be written; true the first time.
    pub fn finish_write(&self) -> bool {
        self.finish(true)
    }
    /// Records that the peer will send no more data; true the first time.
    pub fn finish_read(&self) -> bool {
        self.finish(false)
    }
    fn finish(&self, write: bool) -> bool {
        let both = {
            let mut flags = self.inner.flags.lock();
            if flags.reason.is_some() {
                return false;
            }
            let done = if write {
                &mut flags.write_done
            } else {
                &mut flags.read_done
            };
            if *done {
                return false;
            }
            *done = true;
            flags.write_done && flags.read_done
        };
        if both {
            self.close(None, CloseOrigin::Local);
        }
        true
    }
    /// Local teardown.
    pub fn destroy(&self, error: Option<ErrorInfo>) -> bool {
        self.close(error, CloseOrigin::Local)
    }
    /// Tears the tunnel down once. Later calls are no-ops returning false.
    pub fn close(&self, error: Option<ErrorInfo>, origin: CloseOrigin) -> bool {
        let reason = CloseReason { error, origin };
        {
            let mut flags = self.inner.flags.lock();
            if flags.reason.is_some() {
                return false;
            }
            flags.reason = Some(reason.clone());
        }
        log::debug!(
            "tunnel {} closed origin={:?} error={:?}",
            self.inner.id,
            reason.origin,
            reason.error
        );
        if let Some(ack) = self.inner.ack.lock().take() {
            let _ = ack.send(Err(closed_error(reason.error.clone())));
        }
        self.inner.token.cancel();
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks {
            hook(&reason);
        }
        true
    }
}

impl fmt::Debug for TunnelControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelControl")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

fn closed_error(error: Option<ErrorInfo>) -> ErrorInfo {
    error.unwrap_or_else(|| ErrorInfo::new("tunnel closed before it was connected"))
}

/// Resolves with the peer's acknowledgement arguments or the connect error.
pub struct Connecting {
    receiver: oneshot::Receiver<AckResult>,
}

impl Future for Connecting {
    type Output = AckResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|rs| rs.unwrap_or_else(|_| Err(closed_error(None))))
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn teardown_runs_once() {
        let control = TunnelControl::new(TunnelId::from_u64(1));
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = count.clone();
        control.on_close(move |_| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });
        let mut handles = Vec::new();
        for i in 0..8 {
            let control = control.clone();
            handles.push(std::thread::spawn(move || {
                let origin = if i % 2 == 0 {
                    CloseOrigin::Local
                } else {
                    CloseOrigin::Remote
                };
                control.close(None, origin)
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!control.destroy(Some(ErrorInfo::new("late"))));
        assert_eq!(control.state(), TunnelState::Closed);
        assert!(control.error().is_none());
    }

    #[test]
    fn half_close_walks_the_states() {
        let control = TunnelControl::new(TunnelId::from_u64(2));
        assert_eq!(control.state(), TunnelState::Opening);
        assert!(control.acknowledge(vec![]));
        assert!(!control.acknowledge(vec![]));
        assert_eq!(control.state(), TunnelState::Open);
        assert!(control.finish_write());
        assert!(!control.finish_write());
        assert_eq!(control.state(), TunnelState::ReadOnly);
        assert!(control.finish_read());
        assert_eq!(control.state(), TunnelState::Closed);
        assert!(control.error().is_none());
    }

    #[test]
    fn late_hook_runs_immediately() {
        let control = TunnelControl::new(TunnelId::from_u64(3));
        control.destroy(Some(ErrorInfo::new("boom")));
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        control.on_close(move |reason| {
            *slot.lock() = reason.error.clone();
        });
        assert_eq!(seen.lock().as_ref().unwrap().message, "boom");
    }

    #[tokio::test]
    async fn connecting_resolves() {
        let control = TunnelControl::new(TunnelId::from_u64(4));
        let connecting = control.connecting();
        control.acknowledge(vec![Value::from("ok")]);
        assert_eq!(connecting.await.unwrap(), vec![Value::from("ok")]);

        let control = TunnelControl::new(TunnelId::from_u64(5));
        let connecting = control.connecting();
        control.destroy(Some(ErrorInfo::new("no route to n9")));
        assert_eq!(connecting.await.unwrap_err().message, "no route to n9");
    }
}
