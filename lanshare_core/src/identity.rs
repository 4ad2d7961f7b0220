//! Durable self-signed TLS identity of the receiver.
//!
//! The identity is a PKCS#12 archive (certificate plus its PKCS#8 key, empty
//! password) stored next to the settings. Anything wrong with the stored file
//! is treated exactly like a missing file: a fresh identity replaces it.

use crate::config::config_dir;
use crate::error::{Result, TransferError};
use crate::trust::certificate_fingerprint;
use p12::PFX;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256, SanType,
};
use rsa::pkcs8::EncodePrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

const CERT_FILE_NAME: &str = "tls-server.p12";
const RSA_KEY_BITS: usize = 2048;

/// Empty; the file is readable by its owner only
const ARCHIVE_PASSWORD: &str = "";
const ARCHIVE_FRIENDLY_NAME: &str = "LanShare receiver";

/// Common name and extra DNS name of generated certificates
pub const CERTIFICATE_SUBJECT: &str = "LanShare";

/// Certificate chain and private key presented by the receiver
pub struct ServerIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    fingerprint: String,
}

impl ServerIdentity {
    /// Generate a fresh identity without persisting it
    pub fn generate() -> Result<Self> {
        generate_identity().map(|(identity, _)| identity)
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }

    /// Fingerprint a sender will pin for this receiver
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Loads or creates the identity at a fixed path
pub struct CertificateStore {
    path: PathBuf,
}

impl CertificateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `tls-server.p12` in the app config directory
    pub fn default_location() -> Result<Self> {
        let dir = config_dir()
            .ok_or_else(|| TransferError::Settings("No config directory available".into()))?;
        Ok(Self::new(dir.join(CERT_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the stored identity if it is still usable, otherwise replace it
    pub fn load_or_generate(&self) -> Result<ServerIdentity> {
        if self.path.exists() {
            match self.load() {
                Ok(identity) => {
                    tracing::info!("Loaded TLS identity from {:?}", self.path);
                    return Ok(identity);
                }
                Err(e) => {
                    tracing::warn!(
                        "Stored TLS identity {:?} is unusable ({}), regenerating",
                        self.path,
                        e
                    );
                }
            }
        }

        let (identity, archive) = generate_identity()?;
        self.persist(&archive)?;
        tracing::info!(
            "Generated TLS identity {} at {:?}",
            identity.fingerprint,
            self.path
        );
        Ok(identity)
    }

    fn load(&self) -> Result<ServerIdentity> {
        let bytes = fs::read(&self.path)?;

        let archive = PFX::parse(&bytes)
            .map_err(|e| TransferError::Certificate(format!("Bad PKCS#12 archive: {:?}", e)))?;
        if !archive.verify_mac(ARCHIVE_PASSWORD) {
            return Err(TransferError::Certificate(
                "PKCS#12 integrity check failed".into(),
            ));
        }

        let cert_chain: Vec<CertificateDer<'static>> = archive
            .cert_x509_bags(ARCHIVE_PASSWORD)
            .map_err(|e| TransferError::Certificate(format!("Bad certificate bag: {:?}", e)))?
            .into_iter()
            .map(CertificateDer::from)
            .collect();
        let leaf = cert_chain
            .first()
            .ok_or_else(|| TransferError::Certificate("No certificate in archive".into()))?;

        let key_der = archive
            .key_bags(ARCHIVE_PASSWORD)
            .map_err(|e| TransferError::Certificate(format!("Bad key bag: {:?}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| TransferError::Certificate("No private key in archive".into()))?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        check_server_certificate(leaf)?;

        // The key must be something rustls can actually sign with
        rustls::crypto::ring::default_provider()
            .key_provider
            .load_private_key(key.clone_key())?;

        Ok(ServerIdentity {
            fingerprint: certificate_fingerprint(leaf),
            cert_chain,
            key,
        })
    }

    fn persist(&self, archive: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, archive)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }
}

/// Reject certificates that are expired or not meant for TLS servers
fn check_server_certificate(der: &CertificateDer<'_>) -> Result<()> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| TransferError::Certificate(format!("Unparseable certificate: {}", e)))?;

    if !cert.validity().is_valid() {
        return Err(TransferError::Certificate(
            "Certificate is outside its validity window".into(),
        ));
    }

    let server_auth = cert
        .extended_key_usage()
        .map_err(|e| TransferError::Certificate(format!("Bad extended key usage: {}", e)))?
        .map(|eku| eku.value.server_auth)
        .unwrap_or(false);

    if !server_auth {
        return Err(TransferError::Certificate(
            "Certificate lacks the server authentication usage".into(),
        ));
    }

    Ok(())
}

/// 2048-bit RSA, self-signed, valid from yesterday for one year.
/// Returns the identity and its PKCS#12 encoding.
fn generate_identity() -> Result<(ServerIdentity, Vec<u8>)> {
    let mut rng = rsa::rand_core::OsRng;
    let rsa_key = rsa::RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| TransferError::Certificate(format!("RSA key generation failed: {}", e)))?;
    let pkcs8 = rsa_key
        .to_pkcs8_der()
        .map_err(|e| TransferError::Certificate(format!("PKCS#8 encoding failed: {}", e)))?;
    let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &PKCS_RSA_SHA256)?;

    let mut params = CertificateParams::new(vec![
        "localhost".to_string(),
        CERTIFICATE_SUBJECT.to_string(),
    ])?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, CERTIFICATE_SUBJECT);
    params.distinguished_name = name;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    // Start in the past to tolerate clock skew between peers
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(365);

    let cert = params.self_signed(&key_pair)?;
    let archive = encode_archive(cert.der(), key_der.secret_pkcs8_der())?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let identity = ServerIdentity {
        fingerprint: certificate_fingerprint(&cert_der),
        cert_chain: vec![cert_der],
        key: PrivateKeyDer::Pkcs8(key_der),
    };

    Ok((identity, archive))
}

fn encode_archive(cert_der: &[u8], pkcs8_der: &[u8]) -> Result<Vec<u8>> {
    PFX::new(cert_der, pkcs8_der, None, ARCHIVE_PASSWORD, ARCHIVE_FRIENDLY_NAME)
        .map(|archive| archive.to_der())
        .ok_or_else(|| TransferError::Certificate("PKCS#12 encoding failed".into()))
}
