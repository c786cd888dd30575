use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
// Magpie only targets Unix-like hosts, so we rely on the Unix-specific
// OpenOptions extension traits to enforce filesystem permissions.
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow, bail};
use rand::{RngCore, rngs::OsRng};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType, SerialNumber,
};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::info;
use zeroize::Zeroizing;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_VALIDITY_YEARS: i64 = 10;
const LEAF_VALIDITY_DAYS: i64 = 365;
const CA_COMMON_NAME: &str = "Magpie Root CA";
const CA_ORGANIZATION: &str = "Magpie";

/// The root certificate authority every intercepted host certificate chains
/// up to. The storage directory is an explicit constructor argument.
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_der: Arc<Vec<u8>>,
    cert_pem: Arc<String>,
    key: Arc<KeyPair>,
    params: Arc<CertificateParams>,
}

impl CertificateAuthority {
    /// Load CA material from `ca_dir`, generating and persisting a fresh
    /// root when none exists yet.
    pub fn load_or_generate<P: AsRef<Path>>(ca_dir: P) -> Result<Self> {
        let ca_dir = ca_dir.as_ref();
        fs::create_dir_all(ca_dir)
            .with_context(|| format!("failed to create CA directory {}", ca_dir.display()))?;

        let paths = CaPaths::new(ca_dir);
        match (paths.cert.exists(), paths.key.exists()) {
            (false, false) => Self::generate(&paths),
            (true, true) => Self::load_existing(&paths),
            _ => bail!(
                "incomplete CA material in {}; expected both {} and {}",
                ca_dir.display(),
                CA_CERT_FILE,
                CA_KEY_FILE
            ),
        }
    }

    fn generate(paths: &CaPaths) -> Result<Self> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate CA key: {err}"))?;
        let params = build_ca_params();
        let cert = params
            .self_signed(&key)
            .map_err(|err| anyhow!("failed to self-sign CA certificate: {err}"))?;

        let cert_pem = cert.pem();
        let key_pem = Zeroizing::new(key.serialize_pem());
        write_pem_file(&paths.cert, &cert_pem, false)?;
        write_pem_file(&paths.key, key_pem.as_str(), true)?;

        info!(directory = %paths.dir.display(), "generated new certificate authority");
        Ok(Self {
            cert_der: Arc::new(cert.der().as_ref().to_vec()),
            cert_pem: Arc::new(cert_pem),
            key: Arc::new(key),
            params: Arc::new(params),
        })
    }

    fn load_existing(paths: &CaPaths) -> Result<Self> {
        let cert_pem = fs::read_to_string(&paths.cert)
            .with_context(|| format!("failed to read CA certificate {}", paths.cert.display()))?;
        let cert_der = parse_certificate_pem(&cert_pem, &paths.cert)?;

        let key_pem = Zeroizing::new(
            fs::read_to_string(&paths.key)
                .with_context(|| format!("failed to read CA key {}", paths.key.display()))?,
        );
        let key = KeyPair::from_pem(key_pem.as_ref())
            .map_err(|err| anyhow!("failed to parse CA key: {err}"))?;

        info!(directory = %paths.dir.display(), "loaded existing certificate authority");
        Ok(Self {
            cert_der: Arc::new(cert_der),
            cert_pem: Arc::new(cert_pem),
            key: Arc::new(key),
            params: Arc::new(build_ca_params()),
        })
    }

    /// DER-encoded root certificate, for trust-store installation.
    pub fn ca_certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.as_ref().clone())
    }

    /// PEM-encoded root certificate (a single CERTIFICATE block), the format
    /// the management plane hands to operators.
    pub fn ca_certificate_pem(&self) -> String {
        self.cert_pem.as_ref().clone()
    }

    /// Mint a certificate for one intercepted host. `host` is the CONNECT
    /// authority and may carry a port; an IP literal becomes an IP SAN,
    /// anything else a DNS SAN. The serial number is the current Unix epoch.
    pub fn mint_leaf(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let leaf_params = build_leaf_params(host)?;
        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate leaf key: {err}"))?;
        let issuer = rcgen::Issuer::from_params(self.params.as_ref(), &*self.key);
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &issuer)
            .map_err(|err| anyhow!("failed to sign leaf certificate for '{host}': {err}"))?;

        let key_der = Zeroizing::new(leaf_key.serialize_der());
        let key_der = PrivateKeyDer::try_from(key_der.to_vec())
            .map_err(|err| anyhow!("failed to parse generated leaf key: {err}"))?;

        let chain = vec![
            CertificateDer::from(leaf_cert.der().as_ref().to_vec()),
            self.ca_certificate_der(),
        ];
        let provider = ring::default_provider();
        let certified = CertifiedKey::from_der(chain, key_der, &provider)
            .map_err(|err| anyhow!("failed to build certified key for '{host}': {err}"))?;
        Ok(Arc::new(certified))
    }
}

fn build_ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(random_serial());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;
    set_validity(&mut params, Duration::days(CA_VALIDITY_YEARS * 365));
    params
}

fn build_leaf_params(host: &str) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(epoch_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // An IP target (with any port suffix and brackets stripped) becomes an
    // IP SAN; everything else keeps the authority string as a DNS name.
    let without_port = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    let without_port = without_port.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = without_port.parse::<std::net::IpAddr>() {
        params.subject_alt_names = vec![SanType::IpAddress(ip)];
    } else {
        params.subject_alt_names = vec![SanType::DnsName(
            host.try_into()
                .map_err(|err| anyhow!("host '{host}' is not a valid subject name: {err}"))?,
        )];
    }

    set_validity(&mut params, Duration::days(LEAF_VALIDITY_DAYS));
    Ok(params)
}

fn set_validity(params: &mut CertificateParams, lifetime: Duration) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + lifetime;
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Keep the serial positive and non-zero.
    bytes[0] &= 0x7F;
    if bytes.iter().all(|byte| *byte == 0) {
        bytes[bytes.len() - 1] = 1;
    }
    SerialNumber::from(bytes.to_vec())
}

fn epoch_serial() -> SerialNumber {
    let seconds = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(1);
    SerialNumber::from(seconds)
}

fn write_pem_file(path: &Path, contents: &str, private: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    let mode = if private { 0o600 } else { 0o644 };
    options.mode(mode);
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

fn parse_certificate_pem(pem: &str, path: &Path) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(pem.as_bytes());
    let mut certs = rustls_pemfile::certs(&mut cursor);
    match certs.next() {
        Some(Ok(cert)) => {
            if certs.next().is_some() {
                bail!(
                    "multiple certificates found in {}; expected a single PEM section",
                    path.display()
                );
            }
            Ok(cert.as_ref().to_vec())
        }
        Some(Err(err)) => {
            Err(err).with_context(|| format!("failed to parse certificate at {}", path.display()))
        }
        None => bail!("no certificate found in {}", path.display()),
    }
}

struct CaPaths<'a> {
    dir: &'a Path,
    cert: PathBuf,
    key: PathBuf,
}

impl<'a> CaPaths<'a> {
    fn new(dir: &'a Path) -> Self {
        Self {
            dir,
            cert: dir.join(CA_CERT_FILE),
            key: dir.join(CA_KEY_FILE),
        }
    }
}
