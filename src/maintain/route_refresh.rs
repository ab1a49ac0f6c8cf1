use std::time::Duration;

use crate::dispatcher::Event;
use crate::MeshHandle;

/// Asks the dispatcher to re-advertise and purge its table every `period`.
pub(crate) async fn route_refresh_loop(handle: MeshHandle, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = handle.shutdown_token().cancelled() => break,
            _ = interval.tick() => {}
        }
        if handle.send(Event::RouteRefresh).is_err() {
            break;
        }
    }
}
