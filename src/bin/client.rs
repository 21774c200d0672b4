//! c2link client binary

use anyhow::{Context, Result};
use bytes::Bytes;
use c2link::connector::TlsConnector;
use c2link::transform::{PaddingTransform, XorWrapper};
use c2link::{Connector, Packet, Profile, Setting};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Job ID used for messages sent from the command line
const MESSAGE_ID: u8 = 0x20;

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
    let mut server_addr = "127.0.0.1:8443".to_string();
    let mut transport = "tcp".to_string();
    let mut sleep = 5u64;
    let mut jitter = 0u8;
    let mut passphrase = None;
    let mut padding = None;
    let mut message = None;
    let mut oneshot = false;
    let mut ca_file = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-s" | "--server" => {
                server_addr = args.next().context("Expected server address after -s")?;
            }
            "-t" | "--transport" => {
                transport = args.next().context("Expected transport after -t")?;
            }
            "--sleep" => {
                let value = args.next().context("Expected seconds after --sleep")?;
                sleep = value
                    .parse()
                    .map_err(|e| anyhow::anyhow!("--sleep expects seconds: {}", e))?;
            }
            "--jitter" => {
                let value = args.next().context("Expected percent after --jitter")?;
                jitter = value
                    .parse()
                    .map_err(|e| anyhow::anyhow!("--jitter expects 0-100: {}", e))?;
            }
            "-k" | "--passphrase" => {
                passphrase = Some(args.next().context("Expected passphrase after -k")?);
            }
            "--padding" => {
                padding = Some(args.next().context("Expected range after --padding")?);
            }
            "-m" | "--message" => {
                message = Some(args.next().context("Expected text after -m")?);
            }
            "--oneshot" => oneshot = true,
            "--ca" => {
                ca_file = Some(args.next().context("Expected PEM file after --ca")?);
            }
            "-h" | "--help" => {
                println!("Usage: c2link-client [OPTIONS]");
                println!("Options:");
                println!("  -s, --server ADDRESS     Server address (default: 127.0.0.1:8443)");
                println!("  -t, --transport KIND     tcp, udp, tls, tls-insecure or icmp (default: tcp)");
                println!("      --sleep SECS         Poll interval (default: 5)");
                println!("      --jitter PERCENT     Poll jitter (default: 0)");
                println!("  -k, --passphrase TEXT    Enable the XOR wrapper with this passphrase");
                println!("      --padding MIN-MAX    Enable the padding transform");
                println!("  -m, --message TEXT       Send TEXT once connected");
                println!("      --oneshot            Send the message without a session");
                println!("      --ca FILE            Trust the CA certificates in FILE (implies tls)");
                println!("  -h, --help               Show this help message");
                return Ok(());
            }
            _ => {
                error!("Unknown argument: {}", arg);
                return Err(anyhow::anyhow!("Unknown argument: {}", arg));
            }
        }
    }

    let setting = match transport.as_str() {
        "tcp" => Setting::tcp(),
        "udp" => Setting::udp(),
        "tls" => Setting::tls(false),
        "tls-insecure" => Setting::tls(true),
        "icmp" => Setting::icmp(),
        other => anyhow::bail!("Unknown transport: {}", other),
    };

    let mut builder = Profile::builder()
        .setting(setting)
        .sleep(Duration::from_secs(sleep))
        .jitter(jitter);
    if let Some(passphrase) = passphrase {
        builder = builder.wrapper(Arc::new(XorWrapper::from_passphrase(&passphrase)));
    }
    if let Some(range) = padding {
        let transform = PaddingTransform::from_range(&range)
            .map_err(|e| anyhow::anyhow!("Failed to parse padding range: {}", e))?;
        builder = builder.transform(Arc::new(transform));
    }
    let profile = builder.build();

    let connector: Option<Arc<dyn Connector>> = match ca_file {
        Some(path) => Some(Arc::new(
            TlsConnector::from_ca_file(&path)
                .with_context(|| format!("Failed to load CA certificates from {}", path))?,
        )),
        None => None,
    };

    let packet = message.map(|text| Packet::with_payload(MESSAGE_ID, 0, Bytes::from(text)));

    if oneshot {
        c2link::oneshot(&server_addr, connector, Some(&profile), packet)
            .await
            .context("Oneshot delivery failed")?;
        info!("[Client] Oneshot delivered to {}", server_addr);
        return Ok(());
    }

    let session = c2link::connect_with(&server_addr, connector, Some(&profile), packet)
        .await
        .with_context(|| format!("Failed to connect to {}", server_addr))?;
    info!(
        "[Client] Session {} polling {} every {:?} (±{}%)",
        session.id(),
        server_addr,
        session.sleep(),
        session.jitter()
    );

    let mux = c2link::default_mux();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[Client] Interrupted, closing session");
                session.close().await;
                break;
            }
            _ = session.wait() => {
                info!("[Client] Session closed");
                break;
            }
            job = mux.next() => {
                let Some(job) = job else { break };
                info!(
                    "[Client] Received id={:#04x} job={}: {}",
                    job.packet.id,
                    job.packet.job,
                    String::from_utf8_lossy(&job.packet.payload)
                );
            }
        }
    }
    Ok(())
}
