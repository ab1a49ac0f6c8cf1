//! Physical links to neighbour nodes.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use meshlink_core::pipe::{framed, FramedReader, FramedWriter, LengthPrefixedCodec, LinkQueue};
use meshlink_core::protocol::WireMessage;

use crate::dispatcher::Event;
use crate::error::{Error, Result};
use crate::MeshHandle;

mod handshake;
pub(crate) mod link;
pub(crate) mod listener;

pub(crate) use link::Link;

/// Runs the acceptor handshake on `stream` and brings the link up.
pub(crate) async fn accept<S>(stream: S, handle: &MeshHandle) -> Result<Link>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = handle.config();
    let (mut reader, mut writer) = framed(stream, config.max_frame);
    let peer = match handshake::server(&mut reader, &config.auth, config.handshake_timeout).await
    {
        Ok(peer) => peer,
        Err(e) => {
            log::warn!("inbound handshake rejected: {e}");
            let _ = writer.send(&WireMessage::AuthFailed).await;
            return Err(e);
        }
    };
    reader.set_decoder(Box::new(LengthPrefixedCodec::new(config.max_frame)));
    let (link, queue) = Link::new(&peer, handle);
    if !register(&link, handle).await? {
        log::warn!("node {peer} is already connected, rejecting the new link");
        link.token.cancel();
        let _ = writer.send(&WireMessage::AuthFailed).await;
        return Err(Error::DuplicateNode(peer));
    }
    let reply = WireMessage::AuthOk {
        name: handle.name().to_string(),
    };
    if let Err(e) = writer.send(&reply).await {
        link.token.cancel();
        start(link, queue, reader, writer, handle);
        return Err(e.into());
    }
    start(link.clone(), queue, reader, writer, handle);
    Ok(link)
}

/// Runs the dialer handshake on `stream` and brings the link up.
pub(crate) async fn connect<S>(
    stream: S,
    expected: Option<&str>,
    token: &str,
    handle: &MeshHandle,
) -> Result<Link>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = handle.config();
    let (mut reader, mut writer) = framed(stream, config.max_frame);
    let peer = handshake::client(
        &mut reader,
        &mut writer,
        handle.name(),
        token,
        config.handshake_timeout,
    )
    .await?;
    if let Some(expected) = expected {
        if expected != peer {
            log::warn!("dialed {expected} but the peer calls itself {peer}");
        }
    }
    reader.set_decoder(Box::new(LengthPrefixedCodec::new(config.max_frame)));
    let (link, queue) = Link::new(&peer, handle);
    if !register(&link, handle).await? {
        log::warn!("node {peer} is already connected, dropping the new link");
        link.token.cancel();
        return Err(Error::DuplicateNode(peer));
    }
    start(link.clone(), queue, reader, writer, handle);
    Ok(link)
}

async fn register(link: &Link, handle: &MeshHandle) -> Result<bool> {
    let (accepted, wait) = oneshot::channel();
    handle
        .send(Event::LinkUp {
            link: link.clone(),
            accepted,
        })
        .map_err(|_| Error::Shutdown)?;
    wait.await.map_err(|_| Error::Shutdown)
}

fn start(
    link: Link,
    queue: LinkQueue,
    reader: FramedReader,
    writer: FramedWriter,
    handle: &MeshHandle,
) {
    log::info!("link to {} is up id={}", link.peer, link.id);
    tokio::spawn(link::write_loop(link.clone(), queue, writer));
    tokio::spawn(crate::maintain::heartbeat::heartbeat_loop(
        link.sender.clone(),
        link.token.clone(),
        handle.config().heartbeat_interval,
    ));
    tokio::spawn(link::read_loop(link, reader, handle.clone()));
}
