// src/core/cluster/listener.rs

//! Mutually authenticated peer transport: the TLS listener, the outbound
//! connectors with capped exponential backoff, and CN extraction.

use rand::Rng;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Duration;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, info, warn};
use x509_parser::prelude::FromDer;

use crate::core::VigilError;
use crate::core::cluster::link::{self, LinkDirection};
use crate::core::state::EngineState;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Fraction of the backoff delay added or removed as jitter.
const RECONNECT_JITTER: f64 = 0.2;
/// How often a connector re-checks an endpoint that already has a live link.
const CONNECTED_POLL: Duration = Duration::from_secs(5);

/// The TLS material both link directions are built from.
#[derive(Clone)]
pub struct TlsMaterial {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

/// Builds the acceptor (requiring client certs against the CA) and the
/// connector (offering the local cert, trusting only the CA).
pub fn setup_tls(
    ca_path: &str,
    cert_path: &str,
    key_path: &str,
) -> Result<TlsMaterial, VigilError> {
    let ca_certs = load_certs(ca_path)?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|e| VigilError::Config(format!("invalid CA certificate: {e}")))?;
    }
    let roots = Arc::new(roots);
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let verifier = WebPkiClientVerifier::builder(roots.clone())
        .build()
        .map_err(|e| VigilError::Config(format!("client verifier: {e}")))?;
    let server_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs.clone(), key.clone_key())
        .map_err(|e| VigilError::Config(format!("server TLS config: {e}")))?;

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots.as_ref().clone())
        .with_client_auth_cert(certs, key)
        .map_err(|e| VigilError::Config(format!("client TLS config: {e}")))?;

    Ok(TlsMaterial {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        connector: TlsConnector::from(Arc::new(client_config)),
    })
}

/// Loads PEM certificates.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, VigilError> {
    let file = File::open(path)
        .map_err(|e| VigilError::Config(format!("failed to open certificate '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| VigilError::Config(format!("failed to parse '{path}': {e}")))?;
    if certs.is_empty() {
        return Err(VigilError::Config(format!("no certificates in '{path}'")));
    }
    Ok(certs)
}

/// Loads a PEM private key.
fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, VigilError> {
    let file = File::open(path)
        .map_err(|e| VigilError::Config(format!("failed to open key '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| VigilError::Config(format!("failed to parse key '{path}': {e}")))?
        .ok_or_else(|| VigilError::Config(format!("no private key in '{path}'")))
}

/// The subject CN of the peer certificate: the peer's identity.
pub fn peer_common_name(stream: &TlsStream<TcpStream>) -> Result<String, VigilError> {
    let (_, connection) = stream.get_ref();
    let certs = connection
        .peer_certificates()
        .ok_or_else(|| VigilError::Auth("peer presented no certificate".into()))?;
    let cert = certs
        .first()
        .ok_or_else(|| VigilError::Auth("peer certificate chain is empty".into()))?;
    let (_, parsed) = x509_parser::certificate::X509Certificate::from_der(cert.as_ref())
        .map_err(|e| VigilError::Auth(format!("unparseable peer certificate: {e}")))?;
    parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| VigilError::Auth("peer certificate has no CN".into()))
}

/// The accept loop for inbound peer connections.
pub async fn run_listener(
    engine: Arc<EngineState>,
    acceptor: TlsAcceptor,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), VigilError> {
    let bind = (
        engine.config.cluster.bind_host.as_str(),
        engine.config.cluster.bind_port,
    );
    let listener = TcpListener::bind(bind).await?;
    info!(
        "Cluster listener on {}:{}.",
        engine.config.cluster.bind_host, engine.config.cluster.bind_port
    );
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let engine = engine.clone();
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_inbound(engine, acceptor, stream).await {
                                warn!("Inbound connection from {addr} rejected: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn handle_inbound(
    engine: Arc<EngineState>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
) -> Result<(), VigilError> {
    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| VigilError::Auth(format!("TLS handshake failed: {e}")))?;
    let stream: TlsStream<TcpStream> = TlsStream::from(tls);
    let peer = peer_common_name(&stream)?;
    link::establish(engine, stream, peer, LinkDirection::Inbound).await
}

/// One connector per configured remote endpoint: keeps trying forever with
/// exponential backoff and ±20 % jitter, resetting after every successful
/// session.
pub async fn run_connector(
    engine: Arc<EngineState>,
    connector: TlsConnector,
    endpoint_name: String,
    host: String,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let max_delay = engine.config.cluster.reconnect_max_delay;
    let mut delay = INITIAL_RECONNECT_DELAY;
    loop {
        if engine.links.contains_key(&endpoint_name) {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = tokio::time::sleep(CONNECTED_POLL) => continue,
            }
        }
        match connect_once(&engine, &connector, &endpoint_name, &host, port).await {
            Ok(()) => {
                // The session ran; start the next attempt from scratch.
                delay = INITIAL_RECONNECT_DELAY;
            }
            Err(e) => {
                debug!(
                    "Connection to '{endpoint_name}' ({host}:{port}) failed: {e}. \
                     Retrying in {:.1?}.",
                    delay
                );
                delay = (delay * 2).min(max_delay);
            }
        }
        let jittered = jittered(delay);
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tokio::time::sleep(jittered) => {}
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let base = delay.as_secs_f64();
    let factor = 1.0 + rand::thread_rng().gen_range(-RECONNECT_JITTER..RECONNECT_JITTER);
    Duration::from_secs_f64((base * factor).max(0.05))
}

async fn connect_once(
    engine: &Arc<EngineState>,
    connector: &TlsConnector,
    endpoint_name: &str,
    host: &str,
    port: u16,
) -> Result<(), VigilError> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| VigilError::TransientIo(e.to_string()))?;
    let server_name = ServerName::try_from(endpoint_name.to_string())
        .map_err(|_| VigilError::Config(format!("endpoint name '{endpoint_name}' is not a valid server name")))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| VigilError::Auth(format!("TLS handshake failed: {e}")))?;
    let stream: TlsStream<TcpStream> = TlsStream::from(tls);

    let presented = peer_common_name(&stream)?;
    if presented != endpoint_name {
        return Err(VigilError::Auth(format!(
            "endpoint '{endpoint_name}' presented a certificate for CN '{presented}'"
        )));
    }
    link::establish(
        engine.clone(),
        stream,
        endpoint_name.to_string(),
        LinkDirection::Outbound,
    )
    .await
}
