//! Key material, identity encoding and the per-direction rolling token.
//!
//! An identity is the base64 encoding of the SPKI DER of an RSA public key.
//! Frame payloads on authenticated links are RSA-encrypted chunk-wise with
//! the recipient's public key; the handshake proves key possession with a
//! PKCS#1 v1.5 signature over a transcript of both session seeds.

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use rsa::{
    pkcs8::{DecodePublicKey, EncodePublicKey},
    sha2::{Digest, Sha256},
    traits::PublicKeyParts,
    Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};

/// Base64 public key string, globally unique per client.
pub type Identity = String;

pub const SEED_LEN: usize = 32;
pub const TOKEN_LEN: usize = 32;

// PKCS#1 v1.5 overhead per encrypted block.
const RSA_PADDING_LEN: usize = 11;

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
}

impl KeyPair {
    pub fn generate(bits: usize) -> anyhow::Result<Self> {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .context("generate RSA key pair")?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn identity(&self) -> anyhow::Result<Identity> {
        identity_of(&self.public_key)
    }
}

pub fn identity_of(key: &RsaPublicKey) -> anyhow::Result<Identity> {
    let der = key.to_public_key_der().context("encode public key")?;
    Ok(STANDARD.encode(der.as_bytes()))
}

pub fn identity_key(identity: &str) -> anyhow::Result<RsaPublicKey> {
    let der = STANDARD.decode(identity).context("decode identity")?;
    RsaPublicKey::from_public_key_der(&der).context("parse identity public key")
}

pub fn random_seed() -> [u8; SEED_LEN] {
    let mut seed = [0; SEED_LEN];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
}

/// Evolving nonce binding the frames of one link direction in order.
///
/// Both ends of a direction start from the same seed and advance once per
/// successfully exchanged frame, so after the n-th frame the sender's token
/// equals the receiver's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingToken {
    current: [u8; TOKEN_LEN],
}

impl RollingToken {
    pub fn new(seed: [u8; SEED_LEN]) -> Self {
        Self { current: seed }
    }

    /// Current token value, attached to the next frame in this direction.
    pub fn value(&self) -> [u8; TOKEN_LEN] {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = Sha256::digest(self.current).into()
    }
}

fn transcript_digest(first_seed: &[u8], second_seed: &[u8]) -> [u8; 32] {
    Sha256::new()
        .chain_update(first_seed)
        .chain_update(second_seed)
        .finalize()
        .into()
}

/// Prove possession of the private key over this session's seeds. The
/// transcript is `received_seed || sent_seed` from the prover's view.
pub fn sign_transcript(
    key: &RsaPrivateKey,
    received_seed: &[u8],
    sent_seed: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let digest = transcript_digest(received_seed, sent_seed);
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .context("sign handshake transcript")
}

/// Check the peer's proof. The peer hashed `its received || its sent`,
/// which from our side is `our sent || our received`.
pub fn verify_transcript(
    key: &RsaPublicKey,
    sent_seed: &[u8],
    received_seed: &[u8],
    signature: &[u8],
) -> bool {
    let digest = transcript_digest(sent_seed, received_seed);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}

pub fn encrypt_in_chunks(key: &RsaPublicKey, data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let chunk_len = key.size() - RSA_PADDING_LEN;
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(data.len().div_ceil(chunk_len) * key.size());
    for chunk in data.chunks(chunk_len) {
        out.extend(
            key.encrypt(&mut rng, Pkcs1v15Encrypt, chunk)
                .context("encrypt frame chunk")?,
        );
    }
    Ok(out)
}

pub fn decrypt_in_chunks(key: &RsaPrivateKey, data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let chunk_len = key.size();
    anyhow::ensure!(
        data.len() % chunk_len == 0,
        "ciphertext length {} not a multiple of the key size {chunk_len}",
        data.len(),
    );
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(chunk_len) {
        out.extend(
            key.decrypt(Pkcs1v15Encrypt, chunk)
                .context("decrypt frame chunk")?,
        );
    }
    Ok(out)
}
