//! The certificate and key this host presents, loaded from PEM files or
//! generated on first start.

use super::fingerprint::Fingerprint;
use crate::error::Error;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{info, instrument};

/// Subject names put into generated certificates. Peers never check them.
const GENERATED_SUBJECT_NAMES: [&str; 2] = ["kvmlink", "localhost"];

/// The certificate chain and key this host presents to peers.
#[derive(Debug)]
pub struct LocalIdentity {
    pub(crate) cert_chain: Vec<CertificateDer<'static>>,
    pub(crate) key: PrivateKeyDer<'static>,
}

impl LocalIdentity {
    /// Builds an identity from DER parts.
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, Error> {
        if cert_chain.is_empty() {
            return Err(Error::TlsInvalidCertificate(
                "No certificates found in file".to_string(),
            ));
        }
        Ok(Self { cert_chain, key })
    }

    /// Loads a PEM certificate chain and private key.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, Error> {
        let cert_file = File::open(cert_path).map_err(|e| Error::TlsCertificateLoad {
            path: cert_path.display().to_string(),
            source: e,
        })?;
        let cert_chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}"))
            })?;

        let key_file = File::open(key_path).map_err(|e| Error::TlsKeyLoad {
            path: key_path.display().to_string(),
            source: e,
        })?;
        let key = private_key(&mut BufReader::new(key_file))
            .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
            .ok_or_else(|| Error::TlsInvalidKey("No private key found in file".to_string()))?;

        Self::new(cert_chain, key)
    }

    /// Generates a fresh self-signed identity in memory.
    pub fn generate() -> Result<Self, Error> {
        Ok(Self::generate_pem()?.0)
    }

    fn generate_pem() -> Result<(Self, String, String), Error> {
        let names: Vec<String> = GENERATED_SUBJECT_NAMES.iter().map(|s| s.to_string()).collect();
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| Error::TlsCertificateGenerate(e.to_string()))?;

        let cert_pem = certified.cert.pem();
        let key_pem = certified.key_pair.serialize_pem();
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        Ok((Self::new(vec![cert], key)?, cert_pem, key_pem))
    }

    /// Loads the identity at the given paths, generating and saving a
    /// self-signed one first if neither file exists and `generate` is set.
    #[instrument(skip_all, fields(cert = %cert_path.display()))]
    pub fn load_or_generate(cert_path: &Path, key_path: &Path, generate: bool) -> Result<Self, Error> {
        if !generate || cert_path.exists() || key_path.exists() {
            return Self::load(cert_path, key_path);
        }

        let (identity, cert_pem, key_pem) = Self::generate_pem()?;
        write_pem(cert_path, &cert_pem, false).map_err(|e| Error::TlsCertificateLoad {
            path: cert_path.display().to_string(),
            source: e,
        })?;
        write_pem(key_path, &key_pem, true).map_err(|e| Error::TlsKeyLoad {
            path: key_path.display().to_string(),
            source: e,
        })?;

        info!(fingerprint = %identity.fingerprint(), "Generated self-signed certificate");
        Ok(identity)
    }

    /// Fingerprint of the end-entity certificate, as peers will see it.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_certificate(&self.cert_chain[0])
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }
}

fn write_pem(path: &Path, pem: &str, private: bool) -> std::io::Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, pem)?;
    if private {
        restrict_to_owner(path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
