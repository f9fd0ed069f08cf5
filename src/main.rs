use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axle::{
    adapters::{AppHandler, UpstreamClient, build_router},
    config::{ServerConfig, ServerConfigValidator, TlsConfig},
    core::Forwarder,
    ports::http_client::HttpClient,
    tracing_setup,
    utils::{GracefulShutdown, ServerLifecycle},
};
use axum::serve::{Listener, ListenerExt};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::StreamExt;
use tls_listener::TlsListener;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server listen address
    #[clap(long, default_value = "127.0.0.1:8080", env = "AXLE_ADDR")]
    addr: String,

    /// Upstream base URL; when set, every request is forwarded there
    #[clap(long, env = "AXLE_UPSTREAM")]
    upstream: Option<String>,

    /// TLS certificate file (PEM)
    #[clap(long, env = "AXLE_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS key file (PEM, PKCS#8)
    #[clap(long, env = "AXLE_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Shutdown grace period (e.g. "30s", "1m")
    #[clap(
        long,
        default_value = "1m",
        value_parser = humantime::parse_duration,
        env = "AXLE_SHUTDOWN_GRACE_PERIOD"
    )]
    shutdown_grace_period: Duration,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "info", env = "AXLE_LOG_LEVEL")]
    log_level: String,

    /// Emit logs as JSON instead of human-readable text
    #[clap(long, env = "AXLE_LOG_JSON")]
    log_json: bool,
}

/// Adapter turning a stream of accepted connections into an Axum listener.
struct AxumListener<S> {
    stream: S,
    local_addr: std::net::SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, std::net::SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = std::net::SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("Accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    tracing_setup::init_tracing(&args.log_level, args.log_json)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            This can happen if a provider was already installed.",
            e
        );
    }

    let config = ServerConfig {
        listen_addr: args.addr,
        upstream: args.upstream,
        tls: match (args.tls_cert, args.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path,
                key_path,
            }),
            _ => None,
        },
        shutdown_grace_period: args.shutdown_grace_period,
    };

    // Configuration errors fail closed, before the listener is bound
    ServerConfigValidator::validate(&config).map_err(|e| eyre!("Invalid configuration: {e}"))?;

    let handler = match &config.upstream {
        Some(upstream) => {
            let http_client: Arc<dyn HttpClient> =
                Arc::new(UpstreamClient::new().context("Failed to create upstream client")?);
            let forwarder = Forwarder::new(upstream, http_client, config.tls.is_some())
                .map_err(|e| eyre!("Invalid configuration: {e}"))?;
            AppHandler::Forward(Arc::new(forwarder))
        }
        None => AppHandler::Demo,
    };
    let app = build_router(handler);

    // Signal handler runs for the whole process lifetime; a second
    // interrupt escalates the drain to a forced exit.
    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        signal_handler_shutdown.run_signal_handler().await;
    });

    let lifecycle = ServerLifecycle::new(graceful_shutdown, config.shutdown_grace_period);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        addr = %config.listen_addr,
        upstream = ?config.upstream,
        tls = config.tls.is_some(),
        "start server"
    );

    if let Some(tls) = &config.tls {
        let tls_server_config = load_tls_config(tls)?;
        let local_addr = listener.local_addr().context("Failed to get local addr")?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_server_config));
        let tls_listener = AxumListener {
            stream: TlsListener::new(acceptor, listener),
            local_addr,
        }
        .tap_io(|_io| {});
        lifecycle.run(tls_listener, app).await?;
    } else {
        lifecycle.run(listener, app).await?;
    }

    Ok(())
}

/// Load the inbound TLS certificate chain and private key.
fn load_tls_config(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    use std::{fs::File, io::BufReader};

    use rustls_pemfile::{certs, pkcs8_private_keys};

    let cert_file =
        &mut BufReader::new(File::open(&tls.cert_path).context("failed to open cert file")?);
    let key_file =
        &mut BufReader::new(File::open(&tls.key_path).context("failed to open key file")?);

    let cert_chain = certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    let key = pkcs8_private_keys(key_file)
        .next()
        .transpose()?
        .ok_or_else(|| eyre!("No PKCS#8 private key found in key file"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())?;

    Ok(config)
}
