use crate::connector::tcp::{Upgrade, UpgradeAcceptor};
use crate::connector::{Acceptor, Connection, Connector};
use crate::util::{
    configure_tcp_stream, create_client_config, create_client_config_from_file,
    create_insecure_client_config, default_root_store, host_of,
};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::server::ServerConfig;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// TLS over TCP transport
///
/// The client side verifies certificates against its roots unless built with
/// [`TlsConnector::insecure`]. Listening needs a server config.
#[derive(Clone)]
pub struct TlsConnector {
    client: Arc<ClientConfig>,
    server: Option<Arc<ServerConfig>>,
    skip_verify: bool,
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("skip_verify", &self.skip_verify)
            .field("server", &self.server.is_some())
            .finish()
    }
}

impl TlsConnector {
    /// Verifying client trusting `roots`
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            client: create_client_config(roots),
            server: None,
            skip_verify: false,
        }
    }

    /// Verifying client trusting the bundled public roots
    pub fn verifying() -> Self {
        Self::new(default_root_store())
    }

    /// Verifying client trusting the CA certificates in a PEM file
    pub fn from_ca_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        Ok(Self::from_client_config(create_client_config_from_file(path)?))
    }

    /// Client that accepts any server certificate
    pub fn insecure() -> Self {
        Self {
            client: create_insecure_client_config(),
            server: None,
            skip_verify: true,
        }
    }

    /// Client using a prepared config
    pub fn from_client_config(client: Arc<ClientConfig>) -> Self {
        Self {
            client,
            server: None,
            skip_verify: false,
        }
    }

    /// Enable listening with the given server config
    pub fn with_server_config(mut self, server: Arc<ServerConfig>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn skips_verification(&self) -> bool {
        self.skip_verify
    }
}

#[async_trait]
impl Connector for TlsConnector {
    fn kind(&self) -> &'static str {
        "tls"
    }

    async fn connect(&self, address: &str) -> io::Result<Connection> {
        let server_name = ServerName::try_from(host_of(address).to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let tcp = TcpStream::connect(address).await?;
        configure_tcp_stream(&tcp, address);

        let tls = tokio_rustls::TlsConnector::from(Arc::clone(&self.client))
            .connect(server_name, tcp)
            .await?;
        tracing::debug!("[TLS] Handshake with {} complete", address);
        Ok(Box::new(tls))
    }

    async fn listen(&self, bind: &str) -> io::Result<Box<dyn Acceptor>> {
        let server = self.server.clone().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS listener requires a server certificate",
            )
        })?;
        let listener = TcpListener::bind(bind).await?;
        Ok(Box::new(UpgradeAcceptor::spawn(
            listener,
            TlsUpgrade(tokio_rustls::TlsAcceptor::from(server)),
        )?))
    }
}

/// Server-side TLS handshake on an accepted TCP stream
struct TlsUpgrade(tokio_rustls::TlsAcceptor);

#[async_trait]
impl Upgrade for TlsUpgrade {
    fn label(&self) -> &'static str {
        "TLS"
    }

    async fn upgrade(&self, stream: TcpStream, _peer: &str) -> io::Result<Option<Connection>> {
        let tls = self.0.accept(stream).await?;
        Ok(Some(Box::new(tls)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{create_server_config, create_server_config_from_files};
    use std::io::Write;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn port_of(acceptor: &dyn Acceptor) -> String {
        acceptor.local_addr().unwrap().rsplit(':').next().unwrap().to_string()
    }

    /// Self-signed `localhost` certificate and key written as PEM files
    fn pem_files() -> (tempfile::NamedTempFile, tempfile::NamedTempFile) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(certified.cert.pem().as_bytes()).unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(certified.signing_key.serialize_pem().as_bytes()).unwrap();
        (cert, key)
    }

    #[tokio::test]
    async fn test_insecure_client_against_self_signed() {
        let connector = TlsConnector::insecure().with_server_config(create_server_config().unwrap());
        let acceptor = connector.listen("127.0.0.1:0").await.unwrap();
        let port = port_of(acceptor.as_ref());

        let server = tokio::spawn(async move {
            let (mut conn, _) = acceptor.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
            conn.flush().await.unwrap();
        });

        let mut conn = TlsConnector::insecure()
            .connect(&format!("localhost:{}", port))
            .await
            .unwrap();
        conn.write_all(b"hello").await.unwrap();
        conn.flush().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_does_not_block_handshakes() {
        let connector = TlsConnector::insecure().with_server_config(create_server_config().unwrap());
        let acceptor = connector.listen("127.0.0.1:0").await.unwrap();
        let _silent = TcpStream::connect(acceptor.local_addr().unwrap()).await.unwrap();
        let address = format!("localhost:{}", port_of(acceptor.as_ref()));

        let server = tokio::spawn(async move { acceptor.accept().await.map(|_| ()) });
        let client = tokio::time::timeout(
            Duration::from_secs(3),
            TlsConnector::insecure().connect(&address),
        )
        .await
        .expect("handshake finished behind a silent peer");
        assert!(client.is_ok());
        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("acceptor yielded the handshaken connection")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_ca_file_trusts_its_certificate() {
        let (cert, key) = pem_files();
        let server = create_server_config_from_files(cert.path(), key.path()).unwrap();
        let acceptor = TlsConnector::verifying()
            .with_server_config(server)
            .listen("127.0.0.1:0")
            .await
            .unwrap();
        let address = format!("localhost:{}", port_of(acceptor.as_ref()));
        let _server = tokio::spawn(async move {
            while let Ok((mut conn, _)) = acceptor.accept().await {
                let _ = conn.write_all(b"ok").await;
                let _ = conn.flush().await;
            }
        });

        // Public roots do not cover a self-signed certificate
        let err = TlsConnector::verifying().connect(&address).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let trusting = TlsConnector::from_ca_file(cert.path()).unwrap();
        assert!(!trusting.skips_verification());
        let mut conn = trusting.connect(&address).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_listen_without_certificate_fails() {
        let err = TlsConnector::insecure().listen("127.0.0.1:0").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
