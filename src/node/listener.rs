use tokio::net::TcpListener;

use crate::MeshHandle;

/// Accepts inbound links until the mesh shuts down.
pub(crate) async fn accept_loop(listener: TcpListener, handle: MeshHandle) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = handle.shutdown_token().cancelled() => break,
            rs = listener.accept() => match rs {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("accept failed: {e:?}");
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("set_nodelay {addr}: {e:?}");
        }
        let handle = handle.clone();
        tokio::spawn(async move {
            match super::accept(stream, &handle).await {
                Ok(link) => log::debug!("accepted {} from {addr}", link.peer),
                Err(e) => log::warn!("inbound link from {addr} failed: {e}"),
            }
        });
    }
}
