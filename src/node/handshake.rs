use std::collections::HashMap;
use std::time::Duration;

use meshlink_core::pipe::{FramedReader, FramedWriter, LengthPrefixedCodec};
use meshlink_core::protocol::WireMessage;

use crate::error::{Error, Result};

/// Frame limit on a connection until the handshake has succeeded.
pub(crate) const HANDSHAKE_MAX_FRAME: usize = 64 * 1024;

fn limit_frames(reader: &mut FramedReader) {
    reader.set_decoder(Box::new(LengthPrefixedCodec::new(HANDSHAKE_MAX_FRAME)));
}

/// Dialer side: present our name and token, learn the acceptor's name.
/// `reader` is left limited to [`HANDSHAKE_MAX_FRAME`].
pub(crate) async fn client(
    reader: &mut FramedReader,
    writer: &mut FramedWriter,
    name: &str,
    token: &str,
    timeout: Duration,
) -> Result<String> {
    limit_frames(reader);
    writer
        .send(&WireMessage::Auth {
            user: name.to_string(),
            token: token.to_string(),
        })
        .await?;
    let reply = tokio::time::timeout(timeout, reader.next())
        .await
        .map_err(|_| Error::Timeout("handshake"))??;
    match reply {
        WireMessage::AuthOk { name } => Ok(name),
        WireMessage::AuthFailed => Err(Error::AuthFailed(name.to_string())),
        other => Err(Error::Protocol(format!(
            "expected auth_ok, got {}",
            other.name()
        ))),
    }
}

/// Acceptor side: wait for `auth` and check the token configured for the
/// claimed name. The reply is sent once the dispatcher accepted the peer.
/// `reader` is left limited to [`HANDSHAKE_MAX_FRAME`].
pub(crate) async fn server(
    reader: &mut FramedReader,
    auth: &HashMap<String, String>,
    timeout: Duration,
) -> Result<String> {
    limit_frames(reader);
    let first = tokio::time::timeout(timeout, reader.next())
        .await
        .map_err(|_| Error::Timeout("handshake"))??;
    match first {
        WireMessage::Auth { user, token } => match auth.get(&user) {
            Some(expected) if *expected == token => Ok(user),
            _ => Err(Error::AuthFailed(user)),
        },
        other => Err(Error::Protocol(format!("expected auth, got {}", other.name()))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use meshlink_core::pipe::{framed, DEFAULT_MAX_FRAME};

    #[tokio::test]
    async fn token_must_match() {
        let auth: HashMap<String, String> = [("n2".to_string(), "secret".to_string())].into();
        for (token, ok) in [("secret", true), ("guess", false)] {
            let (a, b) = tokio::io::duplex(1024);
            let (mut client_reader, mut client_writer) = framed(a, 1024);
            let (mut server_reader, mut server_writer) = framed(b, 1024);
            let timeout = Duration::from_secs(1);
            let token = token.to_string();
            let dial = tokio::spawn(async move {
                client(&mut client_reader, &mut client_writer, "n2", &token, timeout).await
            });
            let rs = server(&mut server_reader, &auth, timeout).await;
            assert_eq!(rs.is_ok(), ok);
            let reply = match rs {
                Ok(_) => WireMessage::AuthOk {
                    name: "n1".to_string(),
                },
                Err(_) => WireMessage::AuthFailed,
            };
            server_writer.send(&reply).await.unwrap();
            let dialed = dial.await.unwrap();
            match dialed {
                Ok(name) => {
                    assert!(ok);
                    assert_eq!(name, "n1");
                }
                Err(e) => {
                    assert!(!ok);
                    assert!(matches!(e, Error::AuthFailed(_)));
                }
            }
        }
    }

    #[tokio::test]
    async fn oversized_auth_is_refused_before_it_is_read() {
        let (a, b) = tokio::io::duplex(4096);
        let (_, mut client_writer) = framed(a, DEFAULT_MAX_FRAME);
        let (mut server_reader, _server_writer) = framed(b, DEFAULT_MAX_FRAME);
        tokio::spawn(async move {
            let auth = WireMessage::Auth {
                user: "n2".to_string(),
                token: "x".repeat(HANDSHAKE_MAX_FRAME + 1),
            };
            let _ = client_writer.send(&auth).await;
        });
        let rs = server(&mut server_reader, &HashMap::new(), Duration::from_secs(1)).await;
        let err = rs.unwrap_err();
        assert!(err.to_string().contains("frame too large"), "{err}");
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (_a, b) = tokio::io::duplex(1024);
        let (mut reader, _writer) = framed(b, 1024);
        let rs = server(&mut reader, &HashMap::new(), Duration::from_millis(20)).await;
        assert!(matches!(rs, Err(Error::Timeout(_))));
    }
}
