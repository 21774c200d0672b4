//! Transform/Wrapper pipeline and length-prefixed wire framing
//!
//! Outbound: packet codec, then Transform, then Wrapper, then a 4-byte
//! big-endian length prefix. Inbound reverses every step.

use crate::protocol::codec::{decode_packet, encode_packet};
use crate::protocol::packet::Packet;
use crate::transform::{Transform, Wrapper};
use crate::util::limits::MAX_FRAME_SIZE;
use crate::util::{C2Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Pipeline pairs the optional Wrapper and Transform of a profile or listener
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub wrapper: Option<Arc<dyn Wrapper>>,
    pub transform: Option<Arc<dyn Transform>>,
}

impl Pipeline {
    pub fn new(wrapper: Option<Arc<dyn Wrapper>>, transform: Option<Arc<dyn Transform>>) -> Self {
        Self { wrapper, transform }
    }

    /// Encode a packet into its wire body (without the length prefix)
    pub fn encode(&self, packet: &Packet) -> Result<Bytes> {
        let mut body = encode_packet(packet)?.freeze();
        if let Some(transform) = &self.transform {
            body = transform.encode(body).map_err(invalid)?;
        }
        if let Some(wrapper) = &self.wrapper {
            body = wrapper.wrap(body).map_err(invalid)?;
        }
        Ok(body)
    }

    /// Decode a wire body (without the length prefix) into a packet
    pub fn decode(&self, mut body: Bytes) -> Result<Packet> {
        if let Some(wrapper) = &self.wrapper {
            body = wrapper.unwrap(body).map_err(invalid)?;
        }
        if let Some(transform) = &self.transform {
            body = transform.decode(body).map_err(invalid)?;
        }
        decode_packet(body).map_err(invalid)
    }

    /// Write one packet as a single length-prefixed frame
    pub async fn write_packet<W>(&self, conn: &mut W, packet: &Packet) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let body = self.encode(packet)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(C2Error::InvalidPacket(format!(
                "encoded packet of {} bytes exceeds frame limit",
                body.len()
            )));
        }
        // One buffer and one write so datagram transports carry one frame per datagram
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        conn.write_all(&frame).await?;
        conn.flush().await?;
        tracing::trace!(
            "[Pipeline] wrote packet id={:#04x} job={} ({} bytes on wire)",
            packet.id,
            packet.job,
            frame.len()
        );
        Ok(())
    }

    /// Read one packet; `Ok(None)` when the peer closed before sending anything
    pub async fn read_packet<R>(&self, conn: &mut R) -> Result<Option<Packet>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut len_buf = [0u8; 4];
        if conn.read(&mut len_buf[..1]).await? == 0 {
            return Ok(None);
        }
        conn.read_exact(&mut len_buf[1..]).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(C2Error::InvalidPacket(format!(
                "frame length {} exceeds limit",
                len
            )));
        }
        let mut body = vec![0u8; len];
        conn.read_exact(&mut body).await?;
        self.decode(Bytes::from(body)).map(Some)
    }
}

fn invalid(err: io::Error) -> C2Error {
    C2Error::InvalidPacket(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::message;
    use crate::transform::{PaddingTransform, XorWrapper};
    use tokio::io::duplex;

    fn full_pipeline() -> Pipeline {
        Pipeline::new(
            Some(Arc::new(XorWrapper::from_passphrase("pipeline"))),
            Some(Arc::new(PaddingTransform::new(4, 16))),
        )
    }

    #[tokio::test]
    async fn test_write_read_through_wrapper_and_transform() {
        let pipeline = full_pipeline();
        let (mut a, mut b) = duplex(4096);
        let packet = Packet::with_payload(0x51, 12, Bytes::from("job output"));

        pipeline.write_packet(&mut a, &packet).await.unwrap();
        let read = pipeline.read_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(read, packet);
    }

    #[tokio::test]
    async fn test_mismatched_wrapper_is_decode_error() {
        let (mut a, mut b) = duplex(4096);
        full_pipeline()
            .write_packet(&mut a, &Packet::new(message::HELLO))
            .await
            .unwrap();

        let plain = Pipeline::default();
        let err = plain.read_packet(&mut b).await.unwrap_err();
        assert!(matches!(err, C2Error::InvalidPacket(_)));
    }

    #[tokio::test]
    async fn test_eof_before_frame_is_none() {
        let (a, mut b) = duplex(64);
        drop(a);
        assert!(Pipeline::default().read_packet(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_io_error() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[0, 0, 0, 40, 1, 2]).await.unwrap();
        drop(a);
        let err = Pipeline::default().read_packet(&mut b).await.unwrap_err();
        assert!(matches!(err, C2Error::Io(_)));
    }
}
