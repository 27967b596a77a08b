// ABOUTME: Process-scoped certificate authority for TLS inspection
// ABOUTME: Mints and caches per-host leaf certificates signed by a CA whose key survives restarts

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{ProxyError, Result};

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca-key.pem";
const CA_COMMON_NAME: &str = "Stratus Egress Inspection CA";

pub struct CertificateAuthority {
    ca: Certificate,
    ca_cert_pem: String,
    ca_cert_der: Vec<u8>,
    cert_path: PathBuf,
    leaf_cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .finish_non_exhaustive()
    }
}

fn cert_err(e: impl std::fmt::Display) -> ProxyError {
    ProxyError::Certificate(e.to_string())
}

impl CertificateAuthority {
    /// Load the CA key from `dir`, or generate a new one. The certificate is re-issued
    /// from the stored key, so a `ca.pem` already handed to guests stays valid.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let key_path = dir.join(CA_KEY_FILE);
        let cert_path = dir.join(CA_CERT_FILE);

        let key_pair = match fs::read_to_string(&key_path) {
            Ok(pem) => {
                debug!("Loading proxy CA key from {}", key_path.display());
                Some(KeyPair::from_pem(&pem).map_err(cert_err)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let generated = key_pair.is_none();

        let mut params = CertificateParams::new(Vec::<String>::new());
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Stratus");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2035, 12, 31);
        params.key_pair = key_pair;

        let ca = Certificate::from_params(params).map_err(cert_err)?;
        let ca_cert_der = ca.serialize_der().map_err(cert_err)?;
        let ca_cert_pem = ca.serialize_pem().map_err(cert_err)?;

        if generated {
            fs::write(&key_path, ca.serialize_private_key_pem())?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(&key_path)?.permissions();
                perms.set_mode(0o600);
                fs::set_permissions(&key_path, perms)?;
            }
            info!("Generated proxy CA in {}", dir.display());
        }
        fs::write(&cert_path, &ca_cert_pem)?;

        Ok(Self {
            ca,
            ca_cert_pem,
            ca_cert_der,
            cert_path,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    /// PEM of the CA certificate, installed into guests that get TLS inspection
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_cert_der(&self) -> &[u8] {
        &self.ca_cert_der
    }

    pub fn ca_cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Server-side TLS config presenting a leaf certificate for `host`
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();
        {
            let cache = self.leaf_cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(config) = cache.get(&host) {
                return Ok(config.clone());
            }
        }

        let config = Arc::new(self.mint_server_config(&host)?);
        let mut cache = self.leaf_cache.lock().unwrap_or_else(|p| p.into_inner());
        Ok(cache.entry(host).or_insert(config).clone())
    }

    fn mint_server_config(&self, host: &str) -> Result<ServerConfig> {
        debug!("Minting leaf certificate for {}", host);

        let mut params = CertificateParams::new(Vec::<String>::new());
        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(host.to_string())],
        };
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2035, 12, 31);

        let leaf = Certificate::from_params(params).map_err(cert_err)?;
        let leaf_der = leaf.serialize_der_with_signer(&self.ca).map_err(cert_err)?;
        let key_der = leaf.serialize_private_key_der();

        let chain = vec![
            CertificateDer::from(leaf_der),
            CertificateDer::from(self.ca_cert_der.clone()),
        ];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        let mut config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()?
                .with_no_client_auth()
                .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}
