//! Signed repository commits
//!
//! A commit pins one MST root into the repo's signed history. Commits form a
//! linear chain through `prev`; `rev` increases strictly along the chain and
//! doubles as the firehose sequence anchor.

pub mod serde_bytes_helper;

use bytes::Bytes;
use cid::Cid;

use crate::error::{CommitError, Result};
use crate::mst::util;
use crate::types::{Did, Tid};

/// Commit format version produced by this crate
pub const COMMIT_VERSION: i64 = 3;

/// A repository commit block
///
/// Field declaration order is the canonical serialization order
/// (did, version, data, rev, prev, sig); changing it changes commit CIDs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    /// Repository DID
    pub did: Did,

    /// Commit format version (always 3)
    pub version: i64,

    /// MST root CID
    pub data: Cid,

    /// Revision TID, strictly increasing per repo
    pub rev: Tid,

    /// Previous commit CID; `None` only for the genesis commit
    pub prev: Option<Cid>,

    /// Signature over the canonically-encoded unsigned commit
    #[serde(with = "serde_bytes_helper")]
    pub sig: Bytes,
}

impl Commit {
    /// Build an unsigned commit (empty `sig`)
    pub fn new_unsigned(did: Did, data: Cid, rev: Tid, prev: Option<Cid>) -> Self {
        Self {
            did,
            version: COMMIT_VERSION,
            data,
            rev,
            prev,
            sig: Bytes::new(),
        }
    }

    /// Sign this commit with the repo signing key
    pub fn sign<K: SigningKey + ?Sized>(mut self, key: &K) -> Result<Self> {
        let unsigned = self.unsigned_bytes()?;
        self.sig = key.sign_bytes(&unsigned)?;
        Ok(self)
    }

    /// Canonical bytes of the commit with `sig` emptied, for sign/verify
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.sig = Bytes::new();
        serde_ipld_dagcbor::to_vec(&unsigned)
            .map_err(|e| CommitError::Serialization(Box::new(e)).into())
    }

    /// Serialize to canonical DAG-CBOR
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        serde_ipld_dagcbor::to_vec(self).map_err(|e| CommitError::Serialization(Box::new(e)).into())
    }

    /// Deserialize from DAG-CBOR, rejecting unknown versions
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let commit: Commit = serde_ipld_dagcbor::from_slice(data)
            .map_err(|e| CommitError::Serialization(Box::new(e)))?;
        if commit.version != COMMIT_VERSION {
            return Err(CommitError::InvalidVersion(commit.version).into());
        }
        Ok(commit)
    }

    /// CID of this commit's canonical bytes
    pub fn to_cid(&self) -> Result<Cid> {
        let cbor = self.to_cbor()?;
        util::compute_cid(&cbor)
    }

    /// Verify the signature against a public key
    pub fn verify<V: Verifier + ?Sized>(&self, key: &V) -> Result<()> {
        let unsigned = self.unsigned_bytes()?;
        key.verify_bytes(&unsigned, &self.sig)
    }
}

/// Signing keys usable for repository commits
///
/// Implemented for `k256` (the protocol default), `p256`, and
/// `ed25519_dalek` signing keys.
pub trait SigningKey {
    /// Sign `data`, returning the raw signature bytes
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes>;

    /// Compressed public key bytes
    fn public_key(&self) -> Vec<u8>;
}

/// Verifying keys usable to check commit signatures
pub trait Verifier {
    /// Verify `sig` over `data`
    fn verify_bytes(&self, data: &[u8], sig: &[u8]) -> Result<()>;
}

// secp256k1: signatures are normalized to the low-S form, which prevents
// signature malleability across the network
impl SigningKey for k256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use k256::ecdsa::signature::Signer;
        let sig: k256::ecdsa::Signature = Signer::sign(self, data);
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> Vec<u8> {
        self.verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }
}

impl Verifier for k256::ecdsa::VerifyingKey {
    fn verify_bytes(&self, data: &[u8], sig: &[u8]) -> Result<()> {
        use k256::ecdsa::signature::Verifier as _;
        let sig = k256::ecdsa::Signature::from_slice(sig)
            .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;
        self.verify(data, &sig)
            .map_err(|_| CommitError::SignatureVerificationFailed.into())
    }
}

impl SigningKey for p256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use p256::ecdsa::signature::Signer;
        let sig: p256::ecdsa::Signature = Signer::sign(self, data);
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> Vec<u8> {
        self.verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }
}

impl Verifier for p256::ecdsa::VerifyingKey {
    fn verify_bytes(&self, data: &[u8], sig: &[u8]) -> Result<()> {
        use p256::ecdsa::signature::Verifier as _;
        let sig = p256::ecdsa::Signature::from_slice(sig)
            .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;
        self.verify(data, &sig)
            .map_err(|_| CommitError::SignatureVerificationFailed.into())
    }
}

impl SigningKey for ed25519_dalek::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use ed25519_dalek::Signer;
        let sig = Signer::sign(self, data);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> Vec<u8> {
        self.verifying_key().to_bytes().to_vec()
    }
}

impl Verifier for ed25519_dalek::VerifyingKey {
    fn verify_bytes(&self, data: &[u8], sig: &[u8]) -> Result<()> {
        let sig = ed25519_dalek::Signature::from_slice(sig)
            .map_err(|e| CommitError::InvalidSignature(e.to_string()))?;
        self.verify_strict(data, &sig)
            .map_err(|_| CommitError::SignatureVerificationFailed.into())
    }
}
