//! rustls configuration shared by all secure sockets of a transport.
//!
//! Both ends present self-signed certificates, so neither verifies a chain.
//! Handshake signatures are still checked with the crypto provider, which
//! proves the peer owns the key of the certificate it presented. Whether that
//! certificate is the right one is decided afterwards by the
//! [`TrustVerifier`] from its fingerprint.

use super::certificate::LocalIdentity;
use super::fingerprint::Fingerprint;
use super::trust::{FileTrustStore, MemoryTrustStore, TrustStore, TrustVerifier};
use crate::config::TransportConfig;
use crate::error::Error;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::NoServerSessionStorage;
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, DistinguishedName, ServerConfig,
    ServerConnection, SignatureScheme,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Server name used when the connect address gives none that rustls accepts.
const FALLBACK_SERVER_NAME: &str = "kvmlink";

#[derive(Debug)]
struct PeerCertificateVerifier {
    algorithms: WebPkiSupportedAlgorithms,
    require_client_cert: bool,
}

impl ServerCertVerifier for PeerCertificateVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for PeerCertificateVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.require_client_cert
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client and server configurations plus the trust decision for peers.
///
/// Cheap to share: sockets hold it behind an `Arc`.
pub struct TlsContext {
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
    verifier: TrustVerifier,
    local_fingerprint: Fingerprint,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("local_fingerprint", &self.local_fingerprint)
            .field("policy", self.verifier.policy())
            .finish()
    }
}

impl TlsContext {
    /// Builds the context from an identity and a trust verifier.
    pub fn new(
        identity: LocalIdentity,
        verifier: TrustVerifier,
        require_client_cert: bool,
    ) -> Result<Self, Error> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let peer_verifier = Arc::new(PeerCertificateVerifier {
            algorithms: provider.signature_verification_algorithms,
            require_client_cert,
        });
        let local_fingerprint = identity.fingerprint();
        let LocalIdentity { cert_chain, key } = identity;

        let mut client_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(peer_verifier.clone())
            .with_client_auth_cert(cert_chain.clone(), key.clone_key())
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;

        let mut server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?
            .with_client_cert_verifier(peer_verifier)
            .with_single_cert(cert_chain, key)
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;

        // Every connection runs a full handshake so the peer certificate is
        // always presented for the fingerprint check
        client_config.resumption = Resumption::disabled();
        server_config.session_storage = Arc::new(NoServerSessionStorage {});
        server_config.send_tls13_tickets = 0;

        debug!(%local_fingerprint, require_client_cert, "TLS context built");
        Ok(Self {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
            verifier,
            local_fingerprint,
        })
    }

    /// Builds the context from the transport settings.
    ///
    /// Without configured certificate paths an ephemeral identity is
    /// generated if `tls_generate_cert` is set. Peers then see a new
    /// fingerprint on every start.
    pub fn from_config(config: &TransportConfig) -> Result<Self, Error> {
        let identity = match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => {
                LocalIdentity::load_or_generate(cert, key, config.tls_generate_cert)?
            }
            (None, None) if config.tls_generate_cert => LocalIdentity::generate()?,
            _ => return Err(Error::TlsNotConfigured),
        };

        let store: Arc<dyn TrustStore> = match &config.trust_store {
            Some(path) => Arc::new(FileTrustStore::open(path)?),
            None => Arc::new(MemoryTrustStore::new()),
        };
        let verifier = TrustVerifier::new(config.trust_policy.clone(), store);

        let context = Self::new(identity, verifier, config.tls_require_client_cert)?;
        info!(
            fingerprint = %context.local_fingerprint,
            policy = %config.trust_policy,
            "TLS enabled"
        );
        Ok(context)
    }

    pub(crate) fn client_connection(&self, host: &str) -> Result<ClientConnection, Error> {
        Ok(ClientConnection::new(
            self.client_config.clone(),
            server_name(host)?,
        )?)
    }

    pub(crate) fn server_connection(&self) -> Result<ServerConnection, Error> {
        Ok(ServerConnection::new(self.server_config.clone())?)
    }

    pub fn verifier(&self) -> &TrustVerifier {
        &self.verifier
    }

    /// Fingerprint of the certificate this host presents.
    pub fn local_fingerprint(&self) -> Fingerprint {
        self.local_fingerprint
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(host.to_string())
        .or_else(|_| ServerName::try_from(FALLBACK_SERVER_NAME))
        .map_err(|e| Error::TlsConfigBuild(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secure::TrustPolicy;

    #[test]
    fn unusable_host_falls_back_to_fixed_name() {
        assert!(server_name("10.1.2.3").is_ok());
        assert_eq!(
            server_name("desk.local").unwrap().to_str(),
            "desk.local"
        );
        assert_eq!(
            server_name("not a host!").unwrap().to_str(),
            FALLBACK_SERVER_NAME
        );
    }

    #[test]
    fn missing_certificate_without_generation_is_not_configured() {
        let config = TransportConfig {
            tls_enabled: true,
            tls_generate_cert: false,
            ..TransportConfig::default()
        };
        assert!(matches!(
            TlsContext::from_config(&config),
            Err(Error::TlsNotConfigured)
        ));
    }

    #[test]
    fn generated_context_reports_its_fingerprint() {
        let identity = LocalIdentity::generate().unwrap();
        let expected = identity.fingerprint();
        let verifier = TrustVerifier::new(
            TrustPolicy::TrustOnFirstUse,
            Arc::new(MemoryTrustStore::new()),
        );
        let context = TlsContext::new(identity, verifier, true).unwrap();
        assert_eq!(context.local_fingerprint(), expected);
        assert!(context.server_connection().is_ok());
        assert!(context.client_connection("localhost").is_ok());
    }
}
