use crate::error::Result;
use crate::identity::ServerIdentity;
use crate::trust::TofuServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::sync::Arc;

/// ring provider used by both ends
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// TLS 1.2/1.3 server config presenting `identity`, no client certificates
pub fn server_config(identity: &ServerIdentity) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain().to_vec(), identity.private_key())?;
    Ok(Arc::new(config))
}

/// Client config whose only certificate check is the trust store behind `verifier`
pub fn client_config(verifier: Arc<TofuServerVerifier>) -> Result<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// SNI for `target`. Addresses are used as-is; names rustls rejects fall back
/// to `localhost`, which the receiver certificate always carries.
pub fn server_name_for(target: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(target.trim().to_string())
        .or_else(|_| ServerName::try_from("localhost"))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e).into())
}
