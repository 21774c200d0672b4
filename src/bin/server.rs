//! c2link server binary

use anyhow::{Context, Result};
use c2link::connector::{Connector, Generator, IpConnector, TcpConnector, TlsConnector, UdpConnector, Wc2Connector};
use c2link::server::Server;
use c2link::text::Matcher;
use c2link::transform::{PaddingTransform, XorWrapper};
use c2link::util::{create_server_config, create_server_config_from_files};
use c2link::Profile;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const APP_NAME: &str = "c2link-server";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Parse command line arguments
    let mut args = std::env::args().skip(1);
    let mut listen_addr = "0.0.0.0:8443".to_string();
    let mut name = "default".to_string();
    let mut transport = "tcp".to_string();
    let mut passphrase = None;
    let mut padding = None;
    let mut size = 0usize;
    let mut cert_path = None;
    let mut key_path = None;
    let mut url = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-l" | "--listen" => {
                listen_addr = args.next().context("Expected listen address after -l")?;
            }
            "-n" | "--name" => {
                name = args.next().context("Expected listener name after -n")?;
            }
            "-t" | "--transport" => {
                transport = args.next().context("Expected transport after -t")?;
            }
            "-k" | "--passphrase" => {
                passphrase = Some(args.next().context("Expected passphrase after -k")?);
            }
            "--padding" => {
                padding = Some(args.next().context("Expected range after --padding")?);
            }
            "--size" => {
                let value = args.next().context("Expected queue size after --size")?;
                size = parse_usize(&value, "--size")?;
            }
            "--cert" => {
                cert_path = Some(args.next().context("Expected certificate path after --cert")?);
            }
            "--key" => {
                key_path = Some(args.next().context("Expected private key path after --key")?);
            }
            "--url" => {
                url = Some(args.next().context("Expected URL pattern after --url")?);
            }
            "-V" | "--version" => {
                println!("{APP_NAME} {VERSION}");
                return Ok(());
            }
            "-h" | "--help" => {
                println!("Usage: c2link-server [OPTIONS]");
                println!("Options:");
                println!("  -l, --listen ADDRESS      Listen address (default: 0.0.0.0:8443)");
                println!("  -n, --name NAME           Listener name (default: default)");
                println!("  -t, --transport KIND      tcp, udp, tls, wc2, icmp or ip:<proto> (default: tcp)");
                println!("  -k, --passphrase TEXT     Enable the XOR wrapper with this passphrase");
                println!("      --padding MIN-MAX     Enable the padding transform");
                println!("      --size COUNT          Session queue size (default: 256)");
                println!("      --cert FILE           PEM certificate for the tls transport");
                println!("      --key  FILE           PEM private key for the tls transport");
                println!("      --url PATTERN         Accepted URL pattern for the wc2 transport");
                println!("  -V, --version             Show version information");
                println!("  -h, --help                Show this help message");
                return Ok(());
            }
            _ => {
                error!("Unknown argument: {}", arg);
                return Err(anyhow::anyhow!("Unknown argument: {}", arg));
            }
        }
    }

    let connector: Arc<dyn Connector> = match transport.as_str() {
        "tcp" => Arc::new(TcpConnector),
        "udp" => Arc::new(UdpConnector),
        "icmp" => Arc::new(IpConnector::icmp()),
        "wc2" => Arc::new(Wc2Connector::new(Generator::new(
            url.map(Matcher::new),
            None,
            None,
        ))),
        "tls" => {
            let config = match (cert_path.as_deref(), key_path.as_deref()) {
                (Some(cert), Some(key)) => {
                    info!("[Server] Loading TLS certificate from {}", cert);
                    create_server_config_from_files(cert, key)
                        .with_context(|| format!("Failed to load certificate/key: {cert}, {key}"))?
                }
                (None, None) => {
                    info!("[Server] No certificate provided, generating self-signed certificate");
                    create_server_config().context("Failed to create TLS server config")?
                }
                _ => anyhow::bail!("Both --cert and --key must be provided together"),
            };
            Arc::new(TlsConnector::insecure().with_server_config(config))
        }
        other => match other.strip_prefix("ip:") {
            Some(proto) => Arc::new(IpConnector::new(
                proto
                    .parse::<u8>()
                    .map_err(|e| anyhow::anyhow!("ip protocol must be 0-255: {}", e))?,
            )),
            None => anyhow::bail!("Unknown transport: {}", other),
        },
    };

    let mut builder = Profile::builder().size(size);
    if let Some(passphrase) = passphrase {
        builder = builder.wrapper(Arc::new(XorWrapper::from_passphrase(&passphrase)));
    }
    if let Some(range) = padding {
        let transform = PaddingTransform::from_range(&range)
            .map_err(|e| anyhow::anyhow!("Failed to parse padding range: {}", e))?;
        builder = builder.transform(Arc::new(transform));
    }
    let profile = builder.build();

    info!("[Server] {APP_NAME} v{VERSION}");
    let root = CancellationToken::new();
    let server = Server::with_token(&root, Some(info_span!("c2link.server")));
    let listener = server
        .listen(&name, &listen_addr, Some(connector), Some(&profile))
        .await
        .context("Failed to start listener")?;
    info!("[Server] Listener {} ready on {}", listener.name(), listener.address());

    let scheduler = server.scheduler();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[Server] Interrupted, shutting down");
                break;
            }
            job = scheduler.next() => {
                let Some(job) = job else { break };
                let from = job
                    .session
                    .as_ref()
                    .map(|s| s.device().hostname.clone())
                    .unwrap_or_else(|| "oneshot".to_string());
                info!(
                    "[Server] Job {} id={:#04x} from {}: {}",
                    job.packet.job,
                    job.packet.id,
                    from,
                    String::from_utf8_lossy(&job.packet.payload)
                );
            }
        }
    }

    server.close().await?;
    println!("{}", server.to_json().await);
    Ok(())
}

fn parse_usize(value: &str, flag: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|e| anyhow::anyhow!("{} expects a non-negative integer: {}", flag, e))
}
