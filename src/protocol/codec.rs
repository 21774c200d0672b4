use crate::protocol::packet::{Flags, HEADER_SIZE, Packet};
use crate::util::limits::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

/// Packet codec for encoding and decoding c2link packets
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            tracing::trace!(
                "[PacketCodec] decode: Not enough data for header (have {}, need {})",
                src.len(),
                HEADER_SIZE
            );
            return Ok(None);
        }

        // Peek the header; bytes are only consumed once the payload is complete
        let mut header = &src[..HEADER_SIZE];
        let id = header.get_u8();
        let mut device = [0u8; 16];
        header.copy_to_slice(&mut device);
        let job = header.get_u16();
        let flags = Flags::from_bits(header.get_u64());
        let payload_len = header.get_u32() as usize;

        if payload_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload length {} exceeds limit", payload_len),
            ));
        }

        let total_needed = HEADER_SIZE + payload_len;
        if src.len() < total_needed {
            src.reserve(total_needed - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = if payload_len > 0 {
            src.split_to(payload_len).freeze()
        } else {
            Bytes::new()
        };

        tracing::trace!(
            "[PacketCodec] decode: id={:#04x}, job={}, payload_len={}",
            id,
            job,
            payload_len
        );

        Ok(Some(Packet {
            id,
            device: Uuid::from_bytes(device),
            job,
            flags,
            payload,
        }))
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload length {} exceeds limit", item.payload.len()),
            ));
        }
        dst.reserve(item.total_size());

        dst.put_u8(item.id);
        dst.put_slice(item.device.as_bytes());
        dst.put_u16(item.job);
        dst.put_u64(item.flags.bits());
        dst.put_u32(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}

/// Encode one packet into a fresh buffer
pub fn encode_packet(packet: &Packet) -> io::Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(packet.total_size());
    PacketCodec.encode(packet, &mut buf)?;
    Ok(buf)
}

/// Decode exactly one packet from `data`; trailing or missing bytes are an error
pub fn decode_packet(data: Bytes) -> io::Result<Packet> {
    let mut buf = BytesMut::from(&data[..]);
    match PacketCodec.decode(&mut buf)? {
        Some(packet) if buf.is_empty() => Ok(packet),
        Some(_) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} trailing bytes after packet", buf.len()),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated packet",
        )),
    }
}
