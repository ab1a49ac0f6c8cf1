use std::io;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::WireMessage;

pub mod link;

pub use link::{link_channel, Frame, Inlet, LinkQueue, LinkSender, LinkTunnel, LinkTunnels};

/// Frames above this size are rejected unless configured otherwise.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Bytes a `tunnel::data` frame adds around its chunk. A link whose chunks
/// are more than this below its frame limit never produces an oversized
/// data frame.
pub const DATA_FRAME_OVERHEAD: usize = 64;

pub type ReadHalfBox = Box<dyn AsyncRead + Send + Unpin>;
pub type WriteHalfBox = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait Decoder: Send + Sync {
    /// Reads one frame body into `dst`, replacing its contents.
    async fn decode(&mut self, read: &mut ReadHalfBox, dst: &mut BytesMut) -> io::Result<()>;
}

#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(&mut self, write: &mut WriteHalfBox, data: &[u8]) -> io::Result<()>;
}

/// 4-byte big-endian length, then the body.
#[derive(Copy, Clone, Debug)]
pub struct LengthPrefixedCodec {
    max_frame: usize,
}

impl LengthPrefixedCodec {
    pub fn new(max_frame: usize) -> Self {
        Self {
            max_frame: max_frame.min(u32::MAX as usize),
        }
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

#[async_trait]
impl Decoder for LengthPrefixedCodec {
    async fn decode(&mut self, read: &mut ReadHalfBox, dst: &mut BytesMut) -> io::Result<()> {
        let mut head = [0; 4];
        read.read_exact(&mut head).await?;
        let len = u32::from_be_bytes(head) as usize;
        if len > self.max_frame {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_frame,
            }
            .into());
        }
        dst.clear();
        dst.resize(len, 0);
        read.read_exact(&mut dst[..]).await?;
        Ok(())
    }
}

#[async_trait]
impl Encoder for LengthPrefixedCodec {
    async fn encode(&mut self, write: &mut WriteHalfBox, data: &[u8]) -> io::Result<()> {
        if data.len() > self.max_frame {
            return Err(Error::FrameTooLarge {
                len: data.len(),
                max: self.max_frame,
            }
            .into());
        }
        let mut buf = Vec::with_capacity(4 + data.len());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(data);
        write.write_all(&buf).await?;
        write.flush().await
    }
}

/// Reading side of a link: frames in, [`WireMessage`]s out.
pub struct FramedReader {
    read: ReadHalfBox,
    decoder: Box<dyn Decoder>,
    buf: BytesMut,
}

impl FramedReader {
    pub fn new(read: ReadHalfBox, decoder: Box<dyn Decoder>) -> Self {
        Self {
            read,
            decoder,
            buf: BytesMut::new(),
        }
    }
    /// Swaps the frame decoder, e.g. to change the frame limit once a peer
    /// is trusted.
    pub fn set_decoder(&mut self, decoder: Box<dyn Decoder>) {
        self.decoder = decoder;
    }
    pub async fn next(&mut self) -> Result<WireMessage> {
        self.decoder.decode(&mut self.read, &mut self.buf).await?;
        WireMessage::decode(&self.buf)
    }
}

pub struct FramedWriter {
    write: WriteHalfBox,
    encoder: Box<dyn Encoder>,
}

impl FramedWriter {
    pub fn new(write: WriteHalfBox, encoder: Box<dyn Encoder>) -> Self {
        Self { write, encoder }
    }
    pub async fn send(&mut self, message: &WireMessage) -> Result<()> {
        let buf = message.encode()?;
        self.encoder.encode(&mut self.write, &buf).await?;
        Ok(())
    }
    pub async fn shutdown(&mut self) -> Result<()> {
        self.write.shutdown().await?;
        Ok(())
    }
}

/// Splits any byte stream into length-prefixed message halves.
pub fn framed<S>(stream: S, max_frame: usize) -> (FramedReader, FramedWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let codec = LengthPrefixedCodec::new(max_frame);
    (
        FramedReader::new(Box::new(read), Box::new(codec)),
        FramedWriter::new(Box::new(write), Box::new(codec)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TunnelId;
    use bytes::Bytes;

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (a, b) = tokio::io::duplex(64);
        let (_, mut writer) = framed(a, DEFAULT_MAX_FRAME);
        let (mut reader, _) = framed(b, DEFAULT_MAX_FRAME);
        let id = TunnelId::from_u64(7);
        tokio::spawn(async move {
            for i in 0..32u8 {
                let chunk = Bytes::from(vec![i; 100]);
                writer.send(&WireMessage::Data { id, chunk }).await.unwrap();
            }
            writer.send(&WireMessage::Final { id }).await.unwrap();
        });
        for i in 0..32u8 {
            match reader.next().await.unwrap() {
                WireMessage::Data { chunk, .. } => assert_eq!(chunk, vec![i; 100]),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(reader.next().await.unwrap(), WireMessage::Final { id });
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let (_, mut writer) = framed(a, 1024);
        let (mut reader, _) = framed(b, 16);
        let id = TunnelId::from_u64(1);
        writer
            .send(&WireMessage::Data {
                id,
                chunk: Bytes::from_static(&[0; 64]),
            })
            .await
            .unwrap();
        let err = reader.next().await.unwrap_err();
        assert!(err.to_string().contains("frame too large"), "{err}");
    }

    #[test]
    fn data_frame_overhead_covers_the_largest_header() {
        let id = TunnelId::from_u64(u64::MAX);
        for len in [0, 1, 255, 70_000] {
            let chunk = Bytes::from(vec![0xa5; len]);
            let buf = WireMessage::Data { id, chunk }.encode().unwrap();
            assert!(buf.len() <= len + DATA_FRAME_OVERHEAD, "{len}: {}", buf.len());
        }
    }

    #[tokio::test]
    async fn eof_ends_the_reader() {
        let (a, b) = tokio::io::duplex(64);
        let (mut reader, _) = framed(b, DEFAULT_MAX_FRAME);
        drop(a);
        assert!(reader.next().await.is_err());
    }
}
