//! Web-camouflage transport
//!
//! A TCP stream that opens with an HTTP/1.1 upgrade exchange. The request
//! line, `Host` and `User-Agent` come from [`Matcher`] templates so every
//! connection looks slightly different. The listener only upgrades requests
//! whose values fit the same templates and answers anything else with 404.

use crate::connector::tcp::{Upgrade, UpgradeAcceptor};
use crate::connector::{Acceptor, Connection, Connector};
use crate::text::{Matcher, Pattern};
use crate::util::configure_tcp_stream;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Upper bound on an HTTP preamble
const MAX_HEAD: usize = 8192;
const MAX_HEADERS: usize = 32;
const DEFAULT_URL: &str = "/";
const DEFAULT_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Templates used to build the upgrade request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generator {
    pub url: Option<Matcher>,
    pub host: Option<Matcher>,
    pub agent: Option<Matcher>,
}

impl Generator {
    pub fn new(url: Option<Matcher>, host: Option<Matcher>, agent: Option<Matcher>) -> Self {
        Self { url, host, agent }
    }

    fn render(value: &Option<Matcher>) -> Option<String> {
        value.as_ref().filter(|m| !m.is_empty()).map(Matcher::render)
    }

    /// Request path for the next connection
    pub fn url(&self) -> String {
        Self::render(&self.url).unwrap_or_else(|| DEFAULT_URL.to_string())
    }

    /// Host header for the next connection, falling back to `address`
    pub fn host(&self, address: &str) -> String {
        Self::render(&self.host).unwrap_or_else(|| address.to_string())
    }

    pub fn agent(&self) -> String {
        Self::render(&self.agent).unwrap_or_else(|| DEFAULT_AGENT.to_string())
    }

    fn pattern(value: &Option<Matcher>) -> Option<Pattern> {
        value.as_ref().filter(|m| !m.is_empty()).map(Matcher::matches)
    }
}

/// HTTP-upgrade camouflaged TCP transport
#[derive(Debug, Clone, Default)]
pub struct Wc2Connector {
    pub generator: Generator,
}

impl Wc2Connector {
    pub fn new(generator: Generator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl Connector for Wc2Connector {
    fn kind(&self) -> &'static str {
        "wc2"
    }

    async fn connect(&self, address: &str) -> io::Result<Connection> {
        let mut stream = TcpStream::connect(address).await?;
        configure_tcp_stream(&stream, address);

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
            self.generator.url(),
            self.generator.host(address),
            self.generator.agent(),
        );
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let head = read_head(&mut stream).await?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "malformed upgrade response",
                ));
            }
        }
        if response.code != Some(101) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("upgrade rejected with status {:?}", response.code),
            ));
        }
        Ok(Box::new(stream))
    }

    async fn listen(&self, bind: &str) -> io::Result<Box<dyn Acceptor>> {
        let listener = TcpListener::bind(bind).await?;
        let filter = Wc2Filter {
            url: Generator::pattern(&self.generator.url),
            host: Generator::pattern(&self.generator.host),
            agent: Generator::pattern(&self.generator.agent),
        };
        Ok(Box::new(UpgradeAcceptor::spawn(listener, filter)?))
    }
}

/// Server side of the upgrade: admits requests fitting the templates
struct Wc2Filter {
    url: Option<Pattern>,
    host: Option<Pattern>,
    agent: Option<Pattern>,
}

impl Wc2Filter {
    fn allowed(&self, path: &str, host: &str, agent: &str) -> bool {
        let check = |pattern: &Option<Pattern>, value: &str| {
            pattern.as_ref().is_none_or(|p| p.is_match(value))
        };
        check(&self.url, path) && check(&self.host, host) && check(&self.agent, agent)
    }

    /// Answer the upgrade request, returning whether it was accepted
    async fn respond(&self, stream: &mut TcpStream) -> io::Result<bool> {
        let head = read_head(stream).await?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let allowed = match request.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {
                let header = |name: &str| {
                    request
                        .headers
                        .iter()
                        .find(|h| h.name.eq_ignore_ascii_case(name))
                        .and_then(|h| std::str::from_utf8(h.value).ok())
                        .unwrap_or_default()
                };
                request.method == Some("GET")
                    && self.allowed(
                        request.path.unwrap_or_default(),
                        header("Host"),
                        header("User-Agent"),
                    )
            }
            _ => false,
        };

        let response: &[u8] = if allowed {
            b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n"
        } else {
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        };
        stream.write_all(response).await?;
        stream.flush().await?;
        Ok(allowed)
    }
}

#[async_trait]
impl Upgrade for Wc2Filter {
    fn label(&self) -> &'static str {
        "WC2"
    }

    async fn upgrade(&self, mut stream: TcpStream, _peer: &str) -> io::Result<Option<Connection>> {
        let accepted = self.respond(&mut stream).await?;
        Ok(accepted.then(|| Box::new(stream) as Connection))
    }
}

/// Read up to and including the blank line ending an HTTP head
///
/// Reads one byte at a time so nothing past the head is consumed.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(256);
    loop {
        let byte = stream.read_u8().await?;
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() >= MAX_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP head too large",
            ));
        }
    }
}
