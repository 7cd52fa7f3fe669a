//! Public key rotation on reconnect
//!
//! Keys pushed through the connect-authorization endpoint are only honoured
//! for about a minute, far shorter than a brokered session lives. Every time
//! the session reconnects the public half of the configured private key is
//! sent again so the communicator can still log in.

use async_trait::async_trait;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use ssh_key::public::{EcdsaPublicKey, Ed25519PublicKey, KeyData, RsaPublicKey};
use ssh_key::{PrivateKey, PublicKey};
use std::sync::Arc;
use tracing::debug;

use crate::config::AuthMode;
use crate::error::{BoxError, TunnelError};
use crate::pipeline::InstanceDescriptor;

/// Request sent to the connect-authorization endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyDelivery {
    pub availability_zone: String,
    pub instance_id: String,
    pub login_user: String,
    /// Single-line OpenSSH public key
    pub public_key: String,
}

/// Client of the instance's connect-authorization endpoint
#[async_trait]
pub trait ConnectAuthorizer: Send + Sync {
    /// Returns the endpoint's success flag; `Err` for transport failures
    async fn send_public_key(&self, delivery: &PublicKeyDelivery) -> Result<bool, BoxError>;
}

/// Single-line OpenSSH public key for a private key.
///
/// Accepts OpenSSH keys plus the PEM encodings `ssh-keygen` and EC2 hand out:
/// PKCS#1 RSA, PKCS#8 (RSA, Ed25519, P-256) and SEC1 P-256.
pub fn derive_public_key(private_key: &[u8]) -> Result<String, TunnelError> {
    let text = std::str::from_utf8(private_key)
        .map_err(|_| TunnelError::KeyDerivation("private key is not valid UTF-8".to_string()))?;

    let Some((label, pem)) = find_private_key_block(text) else {
        return Err(TunnelError::KeyDerivation(
            "no PEM encoded private key found".to_string(),
        ));
    };

    let key_data = match label {
        "OPENSSH PRIVATE KEY" => openssh_key_data(pem)?,
        "RSA PRIVATE KEY" => {
            let key = rsa::RsaPrivateKey::from_pkcs1_pem(pem).map_err(derivation_error)?;
            rsa_key_data(&key)?
        }
        "EC PRIVATE KEY" => {
            let key = p256::SecretKey::from_sec1_pem(pem).map_err(derivation_error)?;
            p256_key_data(&key)
        }
        "PRIVATE KEY" => pkcs8_key_data(pem)?,
        "ENCRYPTED PRIVATE KEY" => return Err(passphrase_error()),
        other => {
            return Err(TunnelError::KeyDerivation(format!(
                "unsupported private key type: {}",
                other
            )))
        }
    };

    let text = PublicKey::new(key_data, "")
        .to_openssh()
        .map_err(derivation_error)?;

    Ok(text.trim_end().to_string())
}

/// Label and text of the first `-----BEGIN ... PRIVATE KEY-----` block
fn find_private_key_block(text: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let label = line
            .trim()
            .strip_prefix("-----BEGIN ")
            .and_then(|rest| rest.strip_suffix("-----"))
            .filter(|label| label.ends_with("PRIVATE KEY"));
        if let Some(label) = label {
            return Some((label, &text[offset..]));
        }
        offset += line.len();
    }
    None
}

fn openssh_key_data(pem: &str) -> Result<KeyData, TunnelError> {
    let key = PrivateKey::from_openssh(pem).map_err(derivation_error)?;
    if key.is_encrypted() {
        return Err(passphrase_error());
    }
    Ok(key.public_key().key_data().clone())
}

/// The algorithm is recorded inside the PKCS#8 document
fn pkcs8_key_data(pem: &str) -> Result<KeyData, TunnelError> {
    if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_pem(pem) {
        return rsa_key_data(&key);
    }
    if let Ok(key) = ed25519_dalek::SigningKey::from_pkcs8_pem(pem) {
        return Ok(KeyData::from(Ed25519PublicKey::from(key.verifying_key())));
    }
    if let Ok(key) = p256::SecretKey::from_pkcs8_pem(pem) {
        return Ok(p256_key_data(&key));
    }
    Err(TunnelError::KeyDerivation(
        "unsupported PKCS#8 key algorithm (expected RSA, Ed25519 or P-256)".to_string(),
    ))
}

fn rsa_key_data(key: &rsa::RsaPrivateKey) -> Result<KeyData, TunnelError> {
    let public_key = RsaPublicKey::try_from(&key.to_public_key()).map_err(derivation_error)?;
    Ok(KeyData::from(public_key))
}

fn p256_key_data(key: &p256::SecretKey) -> KeyData {
    let verifying_key = p256::ecdsa::VerifyingKey::from(key.public_key());
    KeyData::from(EcdsaPublicKey::from(verifying_key))
}

fn derivation_error(e: impl std::fmt::Display) -> TunnelError {
    TunnelError::KeyDerivation(e.to_string())
}

fn passphrase_error() -> TunnelError {
    TunnelError::KeyDerivation("passphrase-protected keys are not supported".to_string())
}

/// Pushes fresh public keys when the auth mode needs them
pub struct KeyRotator {
    auth_mode: AuthMode,
    login_user: String,
    authorizer: Arc<dyn ConnectAuthorizer>,
}

impl KeyRotator {
    pub fn new(
        auth_mode: AuthMode,
        login_user: impl Into<String>,
        authorizer: Arc<dyn ConnectAuthorizer>,
    ) -> Self {
        Self {
            auth_mode,
            login_user: login_user.into(),
            authorizer,
        }
    }

    /// Whether reconnects trigger key pushes at all
    pub fn is_active(&self) -> bool {
        self.auth_mode.is_ephemeral()
    }

    pub async fn rotate_if_needed(&self, instance: &InstanceDescriptor) -> Result<(), TunnelError> {
        let AuthMode::EphemeralKey(private_key) = &self.auth_mode else {
            return Ok(());
        };

        let public_key = derive_public_key(private_key)?;
        let delivery = PublicKeyDelivery {
            availability_zone: instance.availability_zone.clone(),
            instance_id: instance.instance_id.clone(),
            login_user: self.login_user.clone(),
            public_key,
        };

        debug!("Sending public key to instance: {}", delivery.instance_id);

        match self.authorizer.send_public_key(&delivery).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TunnelError::key_delivery(
                format!(
                    "failed to send public key to instance {}",
                    delivery.instance_id
                ),
                None,
            )),
            Err(e) => Err(TunnelError::key_delivery(
                format!(
                    "error encountered in sending public key to instance {}: {}",
                    delivery.instance_id, e
                ),
                Some(e),
            )),
        }
    }
}
