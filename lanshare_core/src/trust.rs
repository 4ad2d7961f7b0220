//! Trust-on-first-use pinning of receiver certificates.
//!
//! The first certificate seen for a peer id is pinned; any later, different
//! certificate is rejected until the pin is removed explicitly.

use crate::config::{AppSettings, SettingsService, TrustedPeer};
use crate::error::{Result, TransferError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Upper-case hex SHA-256 of a DER certificate
pub fn certificate_fingerprint(der: &CertificateDer<'_>) -> String {
    hex::encode_upper(Sha256::digest(der.as_ref()))
}

/// Peer ids compare trimmed and case-insensitively
pub fn normalize_peer_id(peer_id: &str) -> String {
    peer_id.trim().to_lowercase()
}

pub struct TrustStore {
    settings: Arc<dyn SettingsService>,
    // Held across the whole read-modify-persist of a validation
    pins: Mutex<HashMap<String, String>>,
}

impl TrustStore {
    pub fn new(settings: Arc<dyn SettingsService>) -> Result<Self> {
        let pins = load_pins(settings.as_ref())?;
        tracing::debug!("Trust store loaded with {} pinned peers", pins.len());
        Ok(Self {
            settings,
            pins: Mutex::new(pins),
        })
    }

    /// Accept `cert` for `peer_id`, pinning it on first contact.
    ///
    /// Synchronous so it can run inside the rustls verifier callback.
    pub fn validate(&self, peer_id: &str, cert: Option<&CertificateDer<'_>>) -> Result<()> {
        let Some(cert) = cert else {
            return Err(TransferError::Trust(format!(
                "Peer {} presented no certificate",
                peer_id.trim()
            )));
        };

        let peer_id = normalize_peer_id(peer_id);
        let fingerprint = certificate_fingerprint(cert);

        let mut pins = self.lock_pins();
        match pins.get(&peer_id) {
            Some(pinned) if *pinned == fingerprint => Ok(()),
            Some(pinned) => {
                tracing::warn!(
                    "Certificate mismatch for {}: pinned {}, presented {}",
                    peer_id,
                    pinned,
                    fingerprint
                );
                Err(TransferError::Trust(format!(
                    "Certificate mismatch for peer {}. Explicit re-trust is required.",
                    peer_id
                )))
            }
            None => {
                pins.insert(peer_id.clone(), fingerprint.clone());
                let persisted = self.settings.update(&mut |settings: &mut AppSettings| {
                    settings.trusted_peers.retain(|p| p.peer_id != peer_id);
                    settings.trusted_peers.push(TrustedPeer {
                        peer_id: peer_id.clone(),
                        fingerprint: fingerprint.clone(),
                    });
                });

                match persisted {
                    Ok(_) => {
                        tracing::info!("Pinned certificate {} for {}", fingerprint, peer_id);
                        Ok(())
                    }
                    Err(e) => {
                        pins.remove(&peer_id);
                        Err(TransferError::Trust(format!(
                            "Could not persist trust for {}: {}",
                            peer_id, e
                        )))
                    }
                }
            }
        }
    }

    /// Forget the pin for `peer_id`. Removing an unknown peer is not an error.
    pub fn remove_trust(&self, peer_id: &str) -> Result<()> {
        let peer_id = normalize_peer_id(peer_id);

        let mut pins = self.lock_pins();
        let previous = pins.remove(&peer_id);

        let persisted = self.settings.update(&mut |settings: &mut AppSettings| {
            settings.trusted_peers.retain(|p| p.peer_id != peer_id);
        });

        if let Err(e) = persisted {
            if let Some(fingerprint) = previous {
                pins.insert(peer_id, fingerprint);
            }
            return Err(e);
        }

        if previous.is_some() {
            tracing::info!("Removed trust for {}", peer_id);
        }
        Ok(())
    }

    /// Pinned peers ordered by id
    pub fn trusted_peers(&self) -> Vec<TrustedPeer> {
        let pins = self.lock_pins();
        let mut peers: Vec<TrustedPeer> = pins
            .iter()
            .map(|(peer_id, fingerprint)| TrustedPeer {
                peer_id: peer_id.clone(),
                fingerprint: fingerprint.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Replace the in-memory mirror with what the settings currently hold
    pub fn reload(&self) -> Result<()> {
        let fresh = load_pins(self.settings.as_ref())?;
        *self.lock_pins() = fresh;
        Ok(())
    }

    fn lock_pins(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.pins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn load_pins(settings: &dyn SettingsService) -> Result<HashMap<String, String>> {
    Ok(settings
        .get()?
        .trusted_peers
        .into_iter()
        .map(|p| (normalize_peer_id(&p.peer_id), p.fingerprint.to_uppercase()))
        .collect())
}

/// rustls verifier that defers the certificate decision to a [`TrustStore`].
///
/// One verifier is built per connection since the peer id is the address
/// being dialled. The reason for a rejection is kept so the caller can
/// report a trust failure rather than a generic handshake error.
pub struct TofuServerVerifier {
    store: Arc<TrustStore>,
    peer_id: String,
    provider: Arc<CryptoProvider>,
    rejection: Mutex<Option<String>>,
}

impl TofuServerVerifier {
    pub fn new(store: Arc<TrustStore>, peer_id: &str, provider: Arc<CryptoProvider>) -> Self {
        Self {
            store,
            peer_id: peer_id.to_string(),
            provider,
            rejection: Mutex::new(None),
        }
    }

    /// Reason the last certificate was refused, if any
    pub fn take_rejection(&self) -> Option<String> {
        self.rejection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl fmt::Debug for TofuServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TofuServerVerifier")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

impl ServerCertVerifier for TofuServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.store.validate(&self.peer_id, Some(end_entity)) {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(e) => {
                let reason = match e {
                    TransferError::Trust(reason) => reason,
                    other => other.to_string(),
                };
                *self
                    .rejection
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason);
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppSettings, MemorySettings};

    fn throwaway_cert() -> CertificateDer<'static> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        CertificateDer::from(certified.cert.der().to_vec())
    }

    fn store() -> (Arc<MemorySettings>, TrustStore) {
        let settings = Arc::new(MemorySettings::default());
        let store = TrustStore::new(settings.clone()).unwrap();
        (settings, store)
    }

    struct ReadOnlySettings;

    impl SettingsService for ReadOnlySettings {
        fn get(&self) -> Result<AppSettings> {
            Ok(AppSettings::default())
        }

        fn save(&self, _settings: &AppSettings) -> Result<()> {
            Err(TransferError::Settings("read-only".into()))
        }
    }

    #[test]
    fn test_fingerprint_is_upper_hex_sha256() {
        let cert = throwaway_cert();
        let fp = certificate_fingerprint(&cert);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_first_contact_pins_and_persists() {
        let (settings, store) = store();
        let cert = throwaway_cert();

        store.validate(" 192.168.1.20 ", Some(&cert)).unwrap();

        let persisted = settings.snapshot().trusted_peers;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].peer_id, "192.168.1.20");
        assert_eq!(persisted[0].fingerprint, certificate_fingerprint(&cert));

        // Same certificate again leaves state untouched
        store.validate("192.168.1.20", Some(&cert)).unwrap();
        assert_eq!(settings.snapshot().trusted_peers.len(), 1);
    }

    #[test]
    fn test_pin_mismatch_remove_then_accept() {
        let (settings, store) = store();
        let original = throwaway_cert();
        let replacement = throwaway_cert();

        store.validate("Peer-A", Some(&original)).unwrap();

        let err = store.validate("peer-a", Some(&replacement)).unwrap_err();
        assert!(matches!(err, TransferError::Trust(_)));
        assert!(err.to_string().contains("mismatch"));
        // Never re-pinned
        assert_eq!(
            store.trusted_peers()[0].fingerprint,
            certificate_fingerprint(&original)
        );

        store.remove_trust("PEER-A").unwrap();
        assert!(settings.snapshot().trusted_peers.is_empty());

        store.validate("peer-a", Some(&replacement)).unwrap();
        assert_eq!(
            store.trusted_peers()[0].fingerprint,
            certificate_fingerprint(&replacement)
        );
    }

    #[test]
    fn test_missing_certificate_rejected() {
        let (settings, store) = store();
        let err = store.validate("10.0.0.9", None).unwrap_err();
        assert!(matches!(err, TransferError::Trust(_)));
        assert!(settings.snapshot().trusted_peers.is_empty());
    }

    #[test]
    fn test_remove_unknown_peer_is_noop() {
        let (_settings, store) = store();
        store.remove_trust("10.0.0.200").unwrap();
        assert!(store.trusted_peers().is_empty());
    }

    #[test]
    fn test_failed_persist_rolls_back_pin() {
        let store = TrustStore::new(Arc::new(ReadOnlySettings)).unwrap();
        let cert = throwaway_cert();

        let err = store.validate("10.0.0.3", Some(&cert)).unwrap_err();
        assert!(matches!(err, TransferError::Trust(_)));
        assert!(store.trusted_peers().is_empty());
    }

    #[test]
    fn test_loads_existing_pins_and_reloads() {
        let cert = throwaway_cert();
        let settings = Arc::new(MemorySettings::new(AppSettings {
            trusted_peers: vec![TrustedPeer {
                peer_id: "10.0.0.4".into(),
                fingerprint: certificate_fingerprint(&cert).to_lowercase(),
            }],
            ..AppSettings::default()
        }));
        let store = TrustStore::new(settings.clone()).unwrap();
        store.validate("10.0.0.4", Some(&cert)).unwrap();

        settings
            .update(&mut |s: &mut AppSettings| s.trusted_peers.clear())
            .unwrap();
        store.reload().unwrap();
        assert!(store.trusted_peers().is_empty());
    }

    #[test]
    fn test_concurrent_first_contact_pins_once() {
        let (settings, store) = store();
        let certs: Vec<_> = (0..4).map(|_| throwaway_cert()).collect();

        let store = &store;
        let accepted: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = certs
                .iter()
                .map(|cert| scope.spawn(move || store.validate("10.1.1.1", Some(cert)).is_ok()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(accepted.iter().filter(|ok| **ok).count(), 1);
        let pinned = settings.snapshot().trusted_peers;
        assert_eq!(pinned.len(), 1);

        let winner = accepted.iter().position(|ok| *ok).unwrap();
        assert_eq!(pinned[0].fingerprint, certificate_fingerprint(&certs[winner]));
    }

    #[test]
    fn test_verifier_records_rejection() {
        let (_settings, store) = store();
        let store = Arc::new(store);
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        store.validate("127.0.0.1", Some(&throwaway_cert())).unwrap();

        let verifier = TofuServerVerifier::new(store, "127.0.0.1", provider);
        let server_name = ServerName::try_from("localhost").unwrap();
        let result = verifier.verify_server_cert(
            &throwaway_cert(),
            &[],
            &server_name,
            &[],
            UnixTime::now(),
        );

        assert!(result.is_err());
        assert!(verifier.take_rejection().unwrap().contains("mismatch"));
        assert!(verifier.take_rejection().is_none());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}
