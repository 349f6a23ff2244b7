//! # QUIC Transport
//!
//! quinn-backed implementation of the transport contracts. Each session
//! rides one bidirectional stream on its own connection; frames are a
//! one-byte protocol version plus a 4-byte big-endian length.
//!
//! Peer identity is established by the application-layer handshake, not by
//! TLS: endpoints present throwaway self-signed certificates and the
//! client verifier accepts any of them. The dangerous() verifier is
//! intentional for that reason.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use quinn::{Endpoint, RecvStream, SendStream};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::transport::{
    Client, Listener, Transport, TransportMessage, MAX_INCOMING_STREAMS,
    TRANSPORT_MESSAGE_MAX_SIZE,
};

/// ALPN protocol identifier; prevents accidental cross-protocol sessions.
pub const ALPN: &[u8] = b"meshwire";

/// Connections idle longer than this are dropped by either side.
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Keep-alive ping interval, well under the idle timeout.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Frame header: version byte + 4-byte big-endian payload length.
const FRAME_HEADER_SIZE: usize = 5;

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// QUIC implementation of [`Transport`].
pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for QuicTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>> {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid listen address {}", addr))?;
        let endpoint = Endpoint::server(build_server_config()?, addr)
            .with_context(|| format!("failed to bind quic endpoint at {}", addr))?;
        debug!(addr = %addr, "quic listener bound");
        Ok(Arc::new(QuicListener { endpoint }))
    }

    async fn dial(&self, addr: &str) -> Result<Arc<dyn Client>> {
        let remote: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid dial address {}", addr))?;
        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("static addr")
        } else {
            "[::]:0".parse().expect("static addr")
        };
        let mut endpoint = Endpoint::client(bind).context("failed to bind client endpoint")?;
        endpoint.set_default_client_config(build_client_config()?);

        let connection = endpoint
            .connect(remote, "meshwire")
            .context("quic connect setup failed")?
            .await
            .with_context(|| format!("quic connect to {} failed", remote))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .context("failed to open session stream")?;

        Ok(Arc::new(QuicClient {
            connection,
            _endpoint: Some(endpoint),
            init: OnceCell::new_with(Some(())),
            server_side: false,
            send: Mutex::new(Some(send)),
            recv: Mutex::new(Some(recv)),
        }))
    }
}

struct QuicListener {
    endpoint: Endpoint,
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&self) -> Result<Arc<dyn Client>> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .context("quic endpoint closed")?;
        let connection = incoming.await.context("quic handshake failed")?;
        debug!(remote = %connection.remote_address(), "quic connection accepted");
        // The session stream is accepted lazily on first receive; the
        // authentication deadline bounds how long a silent peer can hold it.
        Ok(Arc::new(QuicClient {
            connection,
            _endpoint: None,
            init: OnceCell::new(),
            server_side: true,
            send: Mutex::new(None),
            recv: Mutex::new(None),
        }))
    }

    async fn close(&self) {
        self.endpoint.close(0u32.into(), b"listener closed");
    }
}

struct QuicClient {
    connection: quinn::Connection,
    // Dialer-side endpoint kept alive for the connection's lifetime.
    _endpoint: Option<Endpoint>,
    init: OnceCell<()>,
    server_side: bool,
    send: Mutex<Option<SendStream>>,
    recv: Mutex<Option<RecvStream>>,
}

impl QuicClient {
    async fn ensure_stream(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                if self.server_side {
                    let (send, recv) = self
                        .connection
                        .accept_bi()
                        .await
                        .context("failed to accept session stream")?;
                    *self.send.lock().await = Some(send);
                    *self.recv.lock().await = Some(recv);
                }
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Client for QuicClient {
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        if data.len() > TRANSPORT_MESSAGE_MAX_SIZE {
            bail!("message of {} bytes exceeds frame limit", data.len());
        }
        self.ensure_stream().await?;
        let mut guard = self.send.lock().await;
        let stream = guard.as_mut().context("session stream closed")?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
        frame.push(crate::messages::PROTOCOL_VERSION);
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(&data);
        stream.write_all(&frame).await.context("quic send failed")?;
        Ok(())
    }

    async fn receive(&self) -> Result<TransportMessage> {
        self.ensure_stream().await?;
        let mut guard = self.recv.lock().await;
        let stream = guard.as_mut().context("session stream closed")?;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        stream
            .read_exact(&mut header)
            .await
            .context("quic receive failed")?;
        let version = header[0];
        let size = u32::from_be_bytes(header[1..5].try_into().expect("header slice")) as usize;
        if size > TRANSPORT_MESSAGE_MAX_SIZE {
            bail!("frame of {} bytes exceeds limit", size);
        }
        let mut data = vec![0u8; size];
        stream
            .read_exact(&mut data)
            .await
            .context("quic receive failed")?;
        Ok(TransportMessage { version, data })
    }

    fn remote_addr(&self) -> String {
        self.connection.remote_address().to_string()
    }

    async fn close(&self, reason: &str) {
        self.connection.close(0u32.into(), reason.as_bytes());
    }
}

fn build_server_config() -> Result<quinn::ServerConfig> {
    let (certs, key) = generate_session_cert()?;
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .context("tls protocol selection failed")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to create server tls config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create quic server config")?,
    ));
    let transport = Arc::get_mut(&mut server_config.transport)
        .expect("transport config exclusively owned after creation");
    apply_transport_tuning(transport);
    Ok(server_config)
}

fn build_client_config() -> Result<quinn::ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .context("tls protocol selection failed")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create quic client config")?,
    ));
    let mut transport = quinn::TransportConfig::default();
    apply_transport_tuning(&mut transport);
    client_config.transport_config(Arc::new(transport));
    Ok(client_config)
}

fn apply_transport_tuning(transport: &mut quinn::TransportConfig) {
    transport.max_idle_timeout(Some(
        MAX_IDLE_TIMEOUT
            .try_into()
            .expect("idle timeout fits a varint"),
    ));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_concurrent_bidi_streams((MAX_INCOMING_STREAMS as u32).into());
}

fn generate_session_cert() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(vec!["meshwire".to_string()])
        .context("failed to generate session certificate")?;
    let cert = CertificateDer::from(certified.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));
    Ok((vec![cert], key))
}

/// Accepts any server certificate; identity is proven by the
/// application-layer authentication message, never by TLS.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}
