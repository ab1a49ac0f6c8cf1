use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meshlink_core::pipe::LinkSender;
use meshlink_core::protocol::WireMessage;
use tokio_util::sync::CancellationToken;

/// Pings the peer every `period`, keeping its idle timer from firing.
pub(crate) async fn heartbeat_loop(link: LinkSender, token: CancellationToken, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        if let Err(e) = link.send(WireMessage::Ping { timestamp }) {
            log::debug!("heartbeat to {} stopped: {e}", link.peer());
            break;
        }
    }
}
