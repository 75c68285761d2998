#![allow(dead_code)]

use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

/// Guard that holds temporary certificate files and auto-cleans them on drop
pub struct TlsCertGuard {
    pub cert_file: NamedTempFile,
    pub key_file: NamedTempFile,
    pub trust_dir: TempDir,
}

/// Generate a TLS config with a fresh self-signed identity and a trust store
/// file in a temporary directory.
/// Returns (config, cleanup_guard)
pub fn generate_test_tls_config() -> (config::Config, TlsCertGuard) {
    generate_test_tls_config_with(|builder| builder)
}

/// Like [`generate_test_tls_config`], with extra keys set by `extra`.
pub fn generate_test_tls_config_with<F>(extra: F) -> (config::Config, TlsCertGuard)
where
    F: FnOnce(
        config::ConfigBuilder<config::builder::DefaultState>,
    ) -> config::ConfigBuilder<config::builder::DefaultState>,
{
    let (cert_file, key_file) = create_temp_cert_files();
    let trust_dir = TempDir::new().unwrap();
    let trust_store = trust_dir.path().join("trusted_peers.toml");

    let builder = config::Config::builder()
        .set_default("tls_enabled", true)
        .unwrap()
        .set_default("tls_cert", cert_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_key", key_file.path().to_str().unwrap())
        .unwrap()
        .set_default("tls_generate_cert", false)
        .unwrap()
        .set_default("trust_store", trust_store.to_str().unwrap())
        .unwrap()
        .set_default("poll_timeout_ms", 20)
        .unwrap();
    let config = extra(builder).build().unwrap();

    (
        config,
        TlsCertGuard {
            cert_file,
            key_file,
            trust_dir,
        },
    )
}

/// Create temporary certificate files with a self-signed cert
fn create_temp_cert_files() -> (NamedTempFile, NamedTempFile) {
    let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_pem = certified_key.cert.pem();
    let key_pem = certified_key.key_pair.serialize_pem();

    // Create temporary files that will auto-delete on drop
    let mut cert_file = NamedTempFile::new().unwrap();
    let mut key_file = NamedTempFile::new().unwrap();

    cert_file.write_all(cert_pem.as_bytes()).unwrap();
    key_file.write_all(key_pem.as_bytes()).unwrap();

    // Flush to ensure files are written before use
    cert_file.flush().unwrap();
    key_file.flush().unwrap();

    (cert_file, key_file)
}
