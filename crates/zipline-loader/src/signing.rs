//! Manifest signatures.
//!
//! A signature covers the manifest, not the module files; the module files
//! are covered by the manifest's SHA-256 digests, which the loader checks
//! separately.
//!
//! Key encodings, all hex:
//!
//! | algorithm    | private key          | public key                    |
//! |--------------|----------------------|-------------------------------|
//! | `ed25519`    | 32-byte seed         | 32 bytes                      |
//! | `ecdsa-p256` | PKCS#8 document      | 65-byte uncompressed point    |

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use indexmap::IndexMap;
use ring::rand::SystemRandom;
use ring::signature::{
    ECDSA_P256_SHA256_ASN1, ECDSA_P256_SHA256_ASN1_SIGNING, EcdsaKeyPair, UnparsedPublicKey,
};
use serde::Deserialize;

use crate::error::{LoaderError, Result};
use crate::manifest::{ZiplineManifest, signature_payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "ed25519")]
    Ed25519,
    /// ECDSA over P-256 with SHA-256, ASN.1 DER signatures.
    #[serde(rename = "ecdsa-p256")]
    EcdsaP256,
}

enum PrivateKey {
    Ed25519(SigningKey),
    EcdsaP256(EcdsaKeyPair),
}

#[derive(Debug, Clone)]
enum PublicKey {
    Ed25519(VerifyingKey),
    EcdsaP256(Vec<u8>),
}

impl PublicKey {
    fn verify(&self, payload: &[u8], signature: &[u8]) -> bool {
        match self {
            PublicKey::Ed25519(key) => Signature::from_slice(signature)
                .is_ok_and(|signature| key.verify(payload, &signature).is_ok()),
            PublicKey::EcdsaP256(point) => UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, point)
                .verify(payload, signature)
                .is_ok(),
        }
    }
}

/// Signs manifests with one or more named private keys.
#[derive(Default)]
pub struct ManifestSigner {
    keys: IndexMap<String, PrivateKey>,
}

impl ManifestSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key from its hex-encoded 32-byte seed.
    pub fn add_ed25519(mut self, name: impl Into<String>, private_key_hex: &str) -> Result<Self> {
        let name = name.into();
        let seed = decode_fixed::<32>(&name, private_key_hex)?;
        self.keys
            .insert(name, PrivateKey::Ed25519(SigningKey::from_bytes(&seed)));
        Ok(self)
    }

    /// Add a key from its hex-encoded PKCS#8 document.
    pub fn add_ecdsa_p256(mut self, name: impl Into<String>, pkcs8_hex: &str) -> Result<Self> {
        let name = name.into();
        let pkcs8 = decode_hex(&name, pkcs8_hex)?;
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &pkcs8, &SystemRandom::new())
            .map_err(|e| invalid_key(&name, e.to_string()))?;
        self.keys.insert(name, PrivateKey::EcdsaP256(key));
        Ok(self)
    }

    /// Returns a copy of `manifest` carrying one signature per key.
    pub fn sign(&self, manifest: &ZiplineManifest) -> Result<ZiplineManifest> {
        let unsigned = manifest
            .clone()
            .with_signatures(IndexMap::new())
            .with_base_url(None);
        let payload = signature_payload(&unsigned.encode_json()?)?;

        let rng = SystemRandom::new();
        let signatures = self
            .keys
            .iter()
            .map(|(name, key)| {
                let signature = match key {
                    PrivateKey::Ed25519(key) => key.sign(&payload).to_bytes().to_vec(),
                    PrivateKey::EcdsaP256(key) => key
                        .sign(&rng, &payload)
                        .map_err(|_| invalid_key(name, "signing failed".into()))?
                        .as_ref()
                        .to_vec(),
                };
                Ok((name.clone(), hex::encode(signature)))
            })
            .collect::<Result<IndexMap<_, _>>>()?;
        Ok(manifest.clone().with_signatures(signatures))
    }
}

/// Checks manifest signatures against trusted public keys.
///
/// Every trusted key must have produced a valid signature. A verifier with
/// no trusted keys rejects everything; use
/// [`no_signature_checks`](Self::no_signature_checks) to opt out.
#[derive(Debug, Clone)]
pub struct ManifestVerifier {
    trusted_keys: Option<IndexMap<String, PublicKey>>,
}

impl ManifestVerifier {
    pub fn new() -> Self {
        Self {
            trusted_keys: Some(IndexMap::new()),
        }
    }

    pub fn no_signature_checks() -> Self {
        Self { trusted_keys: None }
    }

    /// Trust a key given as its hex-encoded 32-byte public key.
    pub fn add_ed25519(self, name: impl Into<String>, public_key_hex: &str) -> Result<Self> {
        let name = name.into();
        let bytes = decode_fixed::<32>(&name, public_key_hex)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|e| invalid_key(&name, e.to_string()))?;
        Ok(self.trust(name, PublicKey::Ed25519(key)))
    }

    /// Trust a key given as its hex-encoded uncompressed SEC1 point.
    pub fn add_ecdsa_p256(self, name: impl Into<String>, public_key_hex: &str) -> Result<Self> {
        let name = name.into();
        let point = decode_fixed::<65>(&name, public_key_hex)?;
        if point[0] != 0x04 {
            return Err(invalid_key(&name, "expected an uncompressed point".into()));
        }
        Ok(self.trust(name, PublicKey::EcdsaP256(point.to_vec())))
    }

    pub fn add(self, name: impl Into<String>, algorithm: SignatureAlgorithm, public_key_hex: &str) -> Result<Self> {
        match algorithm {
            SignatureAlgorithm::Ed25519 => self.add_ed25519(name, public_key_hex),
            SignatureAlgorithm::EcdsaP256 => self.add_ecdsa_p256(name, public_key_hex),
        }
    }

    fn trust(mut self, name: String, key: PublicKey) -> Self {
        self.trusted_keys.get_or_insert_with(IndexMap::new).insert(name, key);
        self
    }

    pub fn checks_signatures(&self) -> bool {
        self.trusted_keys.is_some()
    }

    /// Verify `manifest`, which was decoded from `manifest_bytes`.
    pub fn verify(&self, manifest_bytes: &[u8], manifest: &ZiplineManifest) -> Result<()> {
        let Some(trusted_keys) = &self.trusted_keys else {
            return Ok(());
        };
        if trusted_keys.is_empty() {
            return Err(LoaderError::NoTrustedKeys);
        }

        let payload = signature_payload(manifest_bytes)?;
        for (name, key) in trusted_keys {
            let verified = manifest
                .signatures()
                .get(name)
                .and_then(|signature| hex::decode(signature).ok())
                .is_some_and(|signature| key.verify(&payload, &signature));
            if !verified {
                tracing::warn!(key = %name, "Manifest signature did not verify");
                return Err(LoaderError::SignatureDidNotVerify { key: name.clone() });
            }
        }
        tracing::debug!(keys = trusted_keys.len(), "Manifest signatures verified");
        Ok(())
    }
}

fn invalid_key(name: &str, message: String) -> LoaderError {
    LoaderError::InvalidKey {
        name: name.to_string(),
        message,
    }
}

fn decode_hex(name: &str, key_hex: &str) -> Result<Vec<u8>> {
    hex::decode(key_hex).map_err(|e| invalid_key(name, e.to_string()))
}

fn decode_fixed<const N: usize>(name: &str, key_hex: &str) -> Result<[u8; N]> {
    decode_hex(name, key_hex)?.try_into().map_err(|bytes: Vec<u8>| {
        invalid_key(name, format!("expected {N} bytes but was {}", bytes.len()))
    })
}
