//! Signature verification against the trusted keyring.
//!
//! Repository indices and package archives are signed with Ed25519 keys.
//! A signature document carries a cleartext payload (one
//! `<hex-sha256>\t<relative-path>` line per covered file) followed by an
//! armored signature block naming the signing key by fingerprint. The
//! keyring maps fingerprints to public keys and assigns each key a trust
//! level depending on where it was installed from.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::paths;

const MESSAGE_HEADER: &str = "-----BEGIN LIMBA SIGNED MESSAGE-----";
const SIGNATURE_HEADER: &str = "-----BEGIN LIMBA SIGNATURE-----";
const SIGNATURE_FOOTER: &str = "-----END LIMBA SIGNATURE-----";

/// Errors raised while processing signatures.
#[derive(Error, Debug)]
pub enum KeyringError {
    /// Keys could not be read from disk.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The signature document does not have the expected armor structure.
    #[error("malformed signature document: {0}")]
    Malformed(String),

    /// The signature does not verify against the named key.
    #[error("signature verification failed for key {0}")]
    BadSignature(String),
}

/// Keyring verdict over a signature, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrustLevel {
    /// Unknown key or no verification performed.
    None,
    /// Key known but explicitly marked low-trust.
    Low,
    /// Key installed by the administrator.
    Medium,
    /// Vendor key shipped with the distribution.
    High,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{name}")
    }
}

/// Result of processing a signature document.
#[derive(Debug)]
pub struct SignatureCheck {
    /// Trust level of the signing key.
    pub trust: TrustLevel,
    /// The signed cleartext payload.
    pub payload: String,
    /// Fingerprint of the signing key.
    pub fingerprint: String,
}

impl SignatureCheck {
    /// Split the payload into `(hash, relative-path)` pairs, skipping
    /// anything that is not a two-column line.
    #[must_use]
    pub fn hash_entries(&self) -> Vec<(&str, &str)> {
        self.payload
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .collect()
    }

    /// Expected hash for a repository-relative path, if covered.
    #[must_use]
    pub fn expected_hash(&self, relative: &str) -> Option<&str> {
        self.hash_entries()
            .into_iter()
            .find(|(_, path)| *path == relative)
            .map(|(hash, _)| hash)
    }
}

/// Trusted public keys, indexed by fingerprint.
#[derive(Debug)]
pub struct Keyring {
    keys: HashMap<String, (VerifyingKey, TrustLevel)>,
}

impl Keyring {
    /// Load the system keyring from the default location.
    pub fn new() -> Result<Self, KeyringError> {
        Self::with_dir(&paths::keyring_dir())
    }

    /// Load keys from `dir`. Keys in `dir/vendor` get High trust, keys
    /// directly in `dir` Medium, keys in `dir/extra` Low. A missing
    /// directory yields an empty keyring.
    pub fn with_dir(dir: &Path) -> Result<Self, KeyringError> {
        let mut keys = HashMap::new();
        for (sub, trust) in [
            (Some("vendor"), TrustLevel::High),
            (None, TrustLevel::Medium),
            (Some("extra"), TrustLevel::Low),
        ] {
            let key_dir: PathBuf = match sub {
                Some(sub) => dir.join(sub),
                None => dir.to_path_buf(),
            };
            if !key_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&key_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                if entry.path().extension().is_none_or(|e| e != "key") {
                    continue;
                }
                match load_key_file(&entry.path()) {
                    Ok(key) => {
                        keys.insert(key_fingerprint(&key), (key, trust));
                    }
                    Err(err) => {
                        tracing::warn!(path = %entry.path().display(), "ignoring unreadable key: {err}");
                    }
                }
            }
        }
        Ok(Self { keys })
    }

    /// Build a keyring from explicit keys (used by tests and tools).
    #[must_use]
    pub fn from_keys(entries: Vec<(VerifyingKey, TrustLevel)>) -> Self {
        let keys = entries
            .into_iter()
            .map(|(key, trust)| (key_fingerprint(&key), (key, trust)))
            .collect();
        Self { keys }
    }

    /// Verify a signature document.
    ///
    /// Returns the signed payload together with the signing key's trust
    /// level. A structurally valid signature from an unknown key yields
    /// [`TrustLevel::None`]; a signature that fails cryptographic
    /// verification against a known key is an error.
    pub fn process_signature(&self, document: &str) -> Result<SignatureCheck, KeyringError> {
        let (payload, fingerprint, signature) = parse_document(document)?;

        let Some((key, trust)) = self.keys.get(&fingerprint) else {
            tracing::debug!("signature by unknown key {fingerprint}");
            return Ok(SignatureCheck {
                trust: TrustLevel::None,
                payload,
                fingerprint,
            });
        };

        key.verify(payload.as_bytes(), &signature)
            .map_err(|_| KeyringError::BadSignature(fingerprint.clone()))?;

        Ok(SignatureCheck {
            trust: *trust,
            payload,
            fingerprint,
        })
    }
}

/// Fingerprint of a public key: hex SHA-256 over the key bytes.
#[must_use]
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compute the hex SHA-256 checksum of a file.
pub fn checksum_for_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex SHA-256 checksum of a byte buffer.
#[must_use]
pub fn checksum_for_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn load_key_file(path: &Path) -> Result<VerifyingKey, KeyringError> {
    let text = fs::read_to_string(path)?;
    let encoded: String = text.split_whitespace().collect();
    let bytes = hex::decode(&encoded)
        .or_else(|_| BASE64.decode(&encoded))
        .map_err(|_| KeyringError::Malformed(format!("undecodable key file {}", path.display())))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KeyringError::Malformed(format!("wrong key length in {}", path.display())))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|_| KeyringError::Malformed(format!("invalid key in {}", path.display())))
}

fn parse_document(document: &str) -> Result<(String, String, Signature), KeyringError> {
    let mut payload = String::new();
    let mut fingerprint = String::new();
    let mut sig_b64 = String::new();

    #[derive(PartialEq)]
    enum Section {
        Preamble,
        Payload,
        Signature,
        Done,
    }
    let mut section = Section::Preamble;

    for line in document.lines() {
        match section {
            Section::Preamble => {
                if line.trim() == MESSAGE_HEADER {
                    section = Section::Payload;
                }
            }
            Section::Payload => {
                if line.trim() == SIGNATURE_HEADER {
                    section = Section::Signature;
                } else {
                    payload.push_str(line);
                    payload.push('\n');
                }
            }
            Section::Signature => {
                let line = line.trim();
                if line == SIGNATURE_FOOTER {
                    section = Section::Done;
                } else if let Some(value) = line.strip_prefix("Key:") {
                    fingerprint = value.trim().to_string();
                } else if !line.is_empty() {
                    sig_b64.push_str(line);
                }
            }
            Section::Done => {}
        }
    }

    if section != Section::Done {
        return Err(KeyringError::Malformed("missing armor markers".to_string()));
    }
    if fingerprint.is_empty() {
        return Err(KeyringError::Malformed("missing Key header".to_string()));
    }

    let sig_bytes = BASE64
        .decode(sig_b64.trim())
        .map_err(|_| KeyringError::Malformed("undecodable signature".to_string()))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| KeyringError::Malformed("wrong signature length".to_string()))?;

    Ok((payload, fingerprint, Signature::from_bytes(&sig_bytes)))
}

/// Produce a signature document over `payload` (tooling and tests).
#[must_use]
pub fn sign_document(signing_key: &ed25519_dalek::SigningKey, payload: &str) -> String {
    use ed25519_dalek::Signer as _;

    // The parser reconstructs the payload line by line with trailing
    // newlines, so the signed bytes must carry one as well.
    let mut payload = payload.to_string();
    if !payload.ends_with('\n') {
        payload.push('\n');
    }

    let signature = signing_key.sign(payload.as_bytes());
    let fingerprint = key_fingerprint(&signing_key.verifying_key());
    let mut doc = String::new();
    doc.push_str(MESSAGE_HEADER);
    doc.push('\n');
    doc.push_str(&payload);
    doc.push_str(SIGNATURE_HEADER);
    doc.push('\n');
    doc.push_str(&format!("Key: {fingerprint}\n"));
    doc.push_str(&BASE64.encode(signature.to_bytes()));
    doc.push('\n');
    doc.push_str(SIGNATURE_FOOTER);
    doc.push('\n');
    doc
}
