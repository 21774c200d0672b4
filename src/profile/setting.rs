//! Compact connector hints
//!
//! A [`Setting`] is a tag byte followed by tag-specific fields. Decoding is
//! forgiving: an empty, unknown or truncated setting simply yields no
//! connector and the caller reports the configuration error.

use crate::connector::{
    Connector, Generator, IpConnector, TcpConnector, TlsConnector, UdpConnector, Wc2Connector,
};
use crate::text::Matcher;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

pub const TAG_TCP: u8 = 0xC0;
pub const TAG_TLS: u8 = 0xC1;
pub const TAG_UDP: u8 = 0xC2;
pub const TAG_IP: u8 = 0xC3;
pub const TAG_WC2: u8 = 0xC4;

/// WC2 header: tag, agent length (u16), url length (u16), host length (u8)
const WC2_HEADER: usize = 6;

/// Encoded connector choice
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Setting(Bytes);

impl Setting {
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    pub fn tcp() -> Self {
        Self(Bytes::from_static(&[TAG_TCP]))
    }

    /// TLS, optionally skipping certificate verification
    pub fn tls(skip_verify: bool) -> Self {
        if skip_verify {
            Self(Bytes::from_static(&[TAG_TLS, 1]))
        } else {
            Self(Bytes::from_static(&[TAG_TLS]))
        }
    }

    pub fn udp() -> Self {
        Self(Bytes::from_static(&[TAG_UDP]))
    }

    /// Raw IP with the given protocol number; `1` means ICMP
    pub fn ip(protocol: u8) -> Self {
        Self(Bytes::copy_from_slice(&[TAG_IP, protocol]))
    }

    pub fn icmp() -> Self {
        Self::ip(1)
    }

    /// WC2 with the generator's patterns; absent or oversized patterns are left out
    pub fn wc2(generator: &Generator) -> Self {
        let pick = |m: &Option<Matcher>, max: usize| -> Vec<u8> {
            m.as_ref()
                .map(|m| m.raw().as_bytes().to_vec())
                .filter(|v| v.len() <= max)
                .unwrap_or_default()
        };
        let agent = pick(&generator.agent, u16::MAX as usize);
        let url = pick(&generator.url, u16::MAX as usize);
        let host = pick(&generator.host, u8::MAX as usize);

        let mut buf = BytesMut::with_capacity(WC2_HEADER + agent.len() + url.len() + host.len());
        buf.put_u8(TAG_WC2);
        buf.put_u16(agent.len() as u16);
        buf.put_u16(url.len() as u16);
        buf.put_u8(host.len() as u8);
        buf.put_slice(&agent);
        buf.put_slice(&url);
        buf.put_slice(&host);
        Self(buf.freeze())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Connector used to dial out
    pub fn connector(&self) -> Option<Arc<dyn Connector>> {
        let (&tag, rest) = self.0.split_first()?;
        match tag {
            TAG_TCP => Some(Arc::new(TcpConnector)),
            TAG_UDP => Some(Arc::new(UdpConnector)),
            TAG_IP => Some(Arc::new(IpConnector::new(*rest.first()?))),
            TAG_TLS if rest.is_empty() => Some(Arc::new(TlsConnector::verifying())),
            TAG_TLS => Some(Arc::new(TlsConnector::insecure())),
            TAG_WC2 => decode_wc2(&self.0).map(|g| Arc::new(Wc2Connector::new(g)) as Arc<dyn Connector>),
            _ => None,
        }
    }

    /// Connector used to bind a listener
    ///
    /// TLS and WC2 hints carry no server-side material, so only IP, UDP and
    /// TCP resolve here.
    pub fn listener(&self) -> Option<Arc<dyn Connector>> {
        let (&tag, rest) = self.0.split_first()?;
        match tag {
            TAG_TCP => Some(Arc::new(TcpConnector)),
            TAG_UDP => Some(Arc::new(UdpConnector)),
            TAG_IP => Some(Arc::new(IpConnector::new(*rest.first()?))),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Setting {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<&'static [u8]> for Setting {
    fn from(value: &'static [u8]) -> Self {
        Self(Bytes::from_static(value))
    }
}

/// Parse the WC2 layout into a generator, `None` when truncated
pub fn decode_wc2(raw: &[u8]) -> Option<Generator> {
    if raw.len() < WC2_HEADER || raw[0] != TAG_WC2 {
        return None;
    }
    let agent_len = u16::from_be_bytes([raw[1], raw[2]]) as usize;
    let url_len = u16::from_be_bytes([raw[3], raw[4]]) as usize;
    let host_len = raw[5] as usize;

    let mut cursor = WC2_HEADER;
    let mut take = |len: usize| -> Option<Option<Matcher>> {
        if len == 0 {
            return Some(None);
        }
        let bytes = raw.get(cursor..cursor + len)?;
        cursor += len;
        Some(Some(Matcher::new(String::from_utf8_lossy(bytes).into_owned())))
    };
    let agent = take(agent_len)?;
    let url = take(url_len)?;
    let host = take(host_len)?;
    Some(Generator::new(url, host, agent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_unknown_yield_nothing() {
        assert!(Setting::default().connector().is_none());
        assert!(Setting::default().listener().is_none());
        assert!(Setting::new(vec![0x7f]).connector().is_none());
    }

    #[test]
    fn test_connect_kinds() {
        assert_eq!(Setting::tcp().connector().unwrap().kind(), "tcp");
        assert_eq!(Setting::udp().connector().unwrap().kind(), "udp");
        assert_eq!(Setting::tls(true).connector().unwrap().kind(), "tls");
        assert_eq!(Setting::tls(false).connector().unwrap().kind(), "tls");
        assert_eq!(Setting::icmp().connector().unwrap().kind(), "icmp");
        assert_eq!(Setting::ip(17).connector().unwrap().kind(), "ip");
    }

    #[test]
    fn test_tls_hint_verification() {
        let verifying = format!("{:?}", Setting::tls(false).connector().unwrap());
        assert!(verifying.contains("skip_verify: false"), "{verifying}");
        let insecure = format!("{:?}", Setting::tls(true).connector().unwrap());
        assert!(insecure.contains("skip_verify: true"), "{insecure}");
    }

    #[test]
    fn test_listen_accepts_only_plain_transports() {
        assert_eq!(Setting::tcp().listener().unwrap().kind(), "tcp");
        assert_eq!(Setting::udp().listener().unwrap().kind(), "udp");
        assert_eq!(Setting::icmp().listener().unwrap().kind(), "icmp");
        assert!(Setting::tls(true).listener().is_none());
        assert!(Setting::wc2(&Generator::default()).listener().is_none());
    }

    #[test]
    fn test_truncated_ip_setting() {
        assert!(Setting::new(vec![TAG_IP]).connector().is_none());
        assert!(Setting::new(vec![TAG_IP]).listener().is_none());
    }

    #[test]
    fn test_wc2_agent_and_host_only() {
        let mut raw = vec![TAG_WC2, 0, 3, 0, 0, 2];
        raw.extend_from_slice(b"abc");
        raw.extend_from_slice(b"hh");

        let generator = decode_wc2(&raw).unwrap();
        assert_eq!(generator.agent, Some(Matcher::new("abc")));
        assert_eq!(generator.host, Some(Matcher::new("hh")));
        assert_eq!(generator.url, None);
        assert_eq!(generator.url(), "/");
        assert_eq!(Setting::new(raw).connector().unwrap().kind(), "wc2");
    }

    #[test]
    fn test_wc2_truncated() {
        assert!(decode_wc2(&[TAG_WC2, 0, 3, 0, 0]).is_none());
        assert!(decode_wc2(&[TAG_WC2, 0, 3, 0, 0, 0, b'a']).is_none());
    }

    #[test]
    fn test_wc2_encode_decode() {
        let generator = Generator::new(
            Some(Matcher::new("/%5fl")),
            Some(Matcher::new("cdn.example")),
            None,
        );
        let setting = Setting::wc2(&generator);
        assert_eq!(setting.as_bytes()[0], TAG_WC2);
        assert_eq!(decode_wc2(setting.as_bytes()).unwrap(), generator);
    }
}
