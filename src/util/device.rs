//! Local device identity
//!
//! The identity is created once per process and shared read-only afterwards.

use crate::util::{C2Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use once_cell::sync::Lazy;
use uuid::Uuid;

/// Identity of one agent host as carried in a Hello packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub id: Uuid,
    pub hostname: String,
    pub os: String,
    pub pid: u32,
}

static LOCAL: Lazy<Device> = Lazy::new(|| Device {
    id: Uuid::new_v4(),
    hostname: std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string()),
    os: std::env::consts::OS.to_string(),
    pid: std::process::id(),
});

/// The identity of this process
pub fn local() -> &'static Device {
    &LOCAL
}

impl Device {
    /// Append the wire form: id (16), pid (u32), then u8-length-prefixed hostname and os
    pub fn marshal(&self, dst: &mut BytesMut) {
        dst.put_slice(self.id.as_bytes());
        dst.put_u32(self.pid);
        put_short_str(dst, &self.hostname);
        put_short_str(dst, &self.os);
    }

    /// Read a device from the front of `src`, leaving any trailing bytes in place
    pub fn unmarshal(src: &mut Bytes) -> Result<Self> {
        if src.remaining() < 20 {
            return Err(C2Error::InvalidPacket("device record too short".into()));
        }
        let mut id = [0u8; 16];
        src.copy_to_slice(&mut id);
        let pid = src.get_u32();
        let hostname = get_short_str(src)?;
        let os = get_short_str(src)?;
        Ok(Self {
            id: Uuid::from_bytes(id),
            hostname,
            os,
            pid,
        })
    }
}

fn put_short_str(dst: &mut BytesMut, value: &str) {
    let bytes = &value.as_bytes()[..value.len().min(u8::MAX as usize)];
    dst.put_u8(bytes.len() as u8);
    dst.put_slice(bytes);
}

fn get_short_str(src: &mut Bytes) -> Result<String> {
    if !src.has_remaining() {
        return Err(C2Error::InvalidPacket("device record truncated".into()));
    }
    let len = src.get_u8() as usize;
    if src.remaining() < len {
        return Err(C2Error::InvalidPacket("device record truncated".into()));
    }
    Ok(String::from_utf8_lossy(&src.split_to(len)).into_owned())
}
