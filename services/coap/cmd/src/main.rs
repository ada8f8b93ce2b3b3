//! CoAP service binary.
//!
//! Runs a CoAP server over UDP, or acts as a one-shot client for pinging a
//! peer, issuing a GET and multicast resource discovery.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use coap_session::{
    dial, Context, MulticastOptions, PooledMessage, ResponseWriter, Server, UdpTransport,
};
use coap_wire::{media_type, Code};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
#[macro_use]
mod logging;

use config::CoapConfig;
use logging::RedbLogFormatter;

/// Resources served under `/.well-known/core`
const LINK_FORMAT: &str = "</time>;rt=\"time\";ct=0,</health>;ct=0";

/// CoAP over UDP server and client
#[derive(Parser, Debug)]
#[command(name = "redb-coap", version, about = "CoAP over UDP server and client")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve requests until interrupted
    Serve {
        /// Listen address, e.g. 0.0.0.0:5683
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Multicast group to join, e.g. 224.0.1.187
        #[arg(long)]
        multicast_group: Option<std::net::IpAddr>,

        /// Close connections idle for this long, e.g. 5m
        #[arg(long)]
        inactivity_timeout: Option<humantime::Duration>,
    },

    /// Ping a peer with an empty confirmable message
    Ping {
        /// Peer address, e.g. 127.0.0.1:5683
        addr: String,

        /// Give up after, e.g. 10s
        #[arg(long, default_value = "30s")]
        timeout: humantime::Duration,
    },

    /// Issue a GET request and print the response
    Get {
        /// Peer address, e.g. 127.0.0.1:5683
        addr: String,

        /// Resource path
        #[arg(default_value = "/.well-known/core")]
        path: String,

        /// Give up after, e.g. 10s
        #[arg(long, default_value = "30s")]
        timeout: humantime::Duration,
    },

    /// Send a multicast GET and print every response
    Discover {
        /// Group address, e.g. 224.0.1.187:5683
        #[arg(default_value = "224.0.1.187:5683")]
        group: SocketAddr,

        /// Resource path
        #[arg(long, default_value = "/.well-known/core")]
        path: String,

        /// Collect responses for, e.g. 2s
        #[arg(long, default_value = "2s")]
        wait: humantime::Duration,

        /// Hop limit of the request
        #[arg(long, default_value_t = coap_session::DEFAULT_HOP_LIMIT)]
        hop_limit: u32,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| {
        Ok::<_, anyhow::Error>(
            EnvFilter::new("info")
                .add_directive(format!("redb_coap={}", args.log_level).parse()?)
                .add_directive(format!("coap_session={}", args.log_level).parse()?)
                .add_directive(format!("coap_wire={}", args.log_level).parse()?),
        )
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(RedbLogFormatter::new("coap"))
        .init();

    let config = CoapConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Serve {
            listen,
            multicast_group,
            inactivity_timeout,
        } => {
            let mut config = config;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(timeout) = inactivity_timeout {
                config.inactivity_timeout = Some(timeout.into());
            }
            serve(config, multicast_group).await
        }
        Command::Ping { addr, timeout } => {
            let conn = dial(&addr, config.session_config()).await?;
            let started = tokio::time::Instant::now();
            conn.ping(&Context::with_timeout(timeout.into()))
                .await
                .with_context(|| format!("ping {addr}"))?;
            println!("pong from {} in {:?}", conn.remote_addr(), started.elapsed());
            conn.close()?;
            Ok(())
        }
        Command::Get {
            addr,
            path,
            timeout,
        } => {
            let conn = dial(&addr, config.session_config()).await?;
            let req = conn.new_get_request(&path);
            let resp = conn
                .do_request(&Context::with_timeout(timeout.into()), req)
                .await
                .with_context(|| format!("GET {addr}{path}"))?;
            println!("{}", resp.code);
            println!("{}", String::from_utf8_lossy(&resp.payload));
            conn.close()?;
            Ok(())
        }
        Command::Discover {
            group,
            path,
            wait,
            hop_limit,
        } => discover(config, group, path, wait.into(), hop_limit).await,
    }
}

fn handle(w: &mut ResponseWriter, req: &PooledMessage) {
    if req.code != Code::GET {
        w.set_code(Code::METHOD_NOT_ALLOWED);
        return;
    }
    match req.path().as_str() {
        "/.well-known/core" => {
            w.set_response(Code::CONTENT, media_type::APP_LINK_FORMAT, LINK_FORMAT)
        }
        "/time" => {
            let now = chrono::Utc::now().to_rfc3339();
            w.set_response(Code::CONTENT, media_type::TEXT_PLAIN, now)
        }
        "/health" => w.set_response(Code::CONTENT, media_type::TEXT_PLAIN, "ok"),
        _ => w.set_code(Code::NOT_FOUND),
    }
}

async fn serve(config: CoapConfig, multicast_group: Option<std::net::IpAddr>) -> anyhow::Result<()> {
    info!("Starting reDB CoAP Service v{}", env!("CARGO_PKG_VERSION"));

    let mut session_config = config
        .session_config()
        .with_handler(handle)
        .with_on_new_conn(|conn| {
            component_info!("server", "Accepted peer {}", conn.remote_addr());
        });
    if let Some(timeout) = config.inactivity_timeout {
        session_config = session_config.with_inactivity_monitor(timeout, |conn| {
            component_info!("monitor", "Closing inactive peer {}", conn.remote_addr());
            let _ = conn.close();
        });
    }
    if let Some(interval) = config.keepalive_interval {
        session_config = session_config.with_keepalive(
            config.keepalive_max_failures,
            interval,
            |conn| {
                component_warn!("monitor", "Peer {} stopped answering keepalives", conn.remote_addr());
                let _ = conn.close();
            },
        );
    }

    let transport = match multicast_group {
        Some(group) => {
            let transport =
                UdpTransport::listen_multicast(SocketAddr::new(group, config.listen_addr.port()))?;
            transport.join_group(group, None)?;
            transport
        }
        None => UdpTransport::bind(config.listen_addr)
            .await
            .with_context(|| format!("bind {}", config.listen_addr))?,
    };

    let server = Server::new(session_config);
    let mut serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(Arc::new(transport)).await })
    };

    let served = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutdown signal received");
            server.stop();
            serving.await?
        }
        res = &mut serving => {
            server.stop();
            res?
        }
    };

    if let Err(err) = served {
        component_error!("server", "Serve loop failed: {}", err);
        return Err(err.into());
    }
    info!("CoAP service stopped");
    Ok(())
}

async fn discover(
    config: CoapConfig,
    group: SocketAddr,
    path: String,
    wait: Duration,
    hop_limit: u32,
) -> anyhow::Result<()> {
    let bind: SocketAddr = match group {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    };
    let transport = UdpTransport::bind(bind).await?;
    transport.set_multicast_loopback(true)?;

    let server = Server::new(config.session_config());
    {
        let server = server.clone();
        tokio::spawn(async move { server.serve(Arc::new(transport)).await });
    }
    while server.local_addr().is_none() {
        tokio::task::yield_now().await;
    }

    let responses = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = responses.clone();
    server
        .discover(
            &Context::with_timeout(wait),
            group,
            &path,
            move |conn, msg| {
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                println!(
                    "{} {} {}",
                    conn.remote_addr(),
                    msg.code,
                    String::from_utf8_lossy(&msg.payload)
                );
            },
            &MulticastOptions::default().hop_limit(hop_limit),
        )
        .await?;

    info!(
        "Discovery finished with {} responses",
        responses.load(std::sync::atomic::Ordering::Relaxed)
    );
    server.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_session::{Config, MessagePool};
    use coap_wire::{Message, MessageType};

    fn request(code: Code, path: &str) -> PooledMessage {
        let mut msg = Message::new(MessageType::Confirmable, code, 1);
        msg.set_path(path);
        MessagePool::default().wrap(msg)
    }

    #[tokio::test]
    async fn test_handler_routes() {
        let server = Server::new(Config::new());
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let s = server.clone();
        tokio::spawn(async move { s.serve(Arc::new(transport)).await });
        while server.local_addr().is_none() {
            tokio::task::yield_now().await;
        }
        let conn = server.new_conn("127.0.0.1:9".parse().unwrap()).unwrap();

        let mut w = ResponseWriter::new(conn.clone());
        handle(&mut w, &request(Code::GET, "/.well-known/core"));
        let resp = w.response().unwrap();
        assert_eq!(resp.code, Code::CONTENT);
        assert_eq!(resp.content_format(), Some(media_type::APP_LINK_FORMAT));

        let mut w = ResponseWriter::new(conn.clone());
        handle(&mut w, &request(Code::GET, "/missing"));
        assert_eq!(w.response().unwrap().code, Code::NOT_FOUND);

        let mut w = ResponseWriter::new(conn);
        handle(&mut w, &request(Code::DELETE, "/time"));
        assert_eq!(w.response().unwrap().code, Code::METHOD_NOT_ALLOWED);

        server.stop();
    }
}
