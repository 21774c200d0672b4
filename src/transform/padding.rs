use crate::transform::Transform;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use std::io;

/// Default padding range in bytes
pub const DEFAULT_PADDING_RANGE: &str = "30-400";

/// PaddingTransform prefixes each packet with a random amount of filler
///
/// Encoded form: padding length (u16 BE), padding bytes, original data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingTransform {
    min: u16,
    max: u16,
}

impl Default for PaddingTransform {
    fn default() -> Self {
        Self { min: 30, max: 400 }
    }
}

impl PaddingTransform {
    /// Create a transform padding with `min..=max` bytes
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// Parse a `min-max` range such as `"30-400"`
    pub fn from_range(range: &str) -> Result<Self, String> {
        let (min_str, max_str) = range
            .split_once('-')
            .ok_or_else(|| format!("invalid padding range {:?}", range))?;
        let min = min_str
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid padding minimum {:?}", min_str))?;
        let max = max_str
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid padding maximum {:?}", max_str))?;
        Ok(Self::new(min, max))
    }

    fn next_size(&self) -> usize {
        if self.min == self.max {
            self.min as usize
        } else {
            rand::random_range(self.min..=self.max) as usize
        }
    }
}

impl Transform for PaddingTransform {
    fn encode(&self, data: Bytes) -> io::Result<Bytes> {
        let size = self.next_size();
        let mut buf = BytesMut::with_capacity(2 + size + data.len());
        buf.put_u16(size as u16);
        buf.resize(2 + size, 0);
        rand::rng().fill_bytes(&mut buf[2..]);
        buf.extend_from_slice(&data);
        Ok(buf.freeze())
    }

    fn decode(&self, mut data: Bytes) -> io::Result<Bytes> {
        if data.len() < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "padded data too short",
            ));
        }
        let size = data.get_u16() as usize;
        if data.len() < size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "padding length exceeds data",
            ));
        }
        data.advance(size);
        Ok(data)
    }
}
