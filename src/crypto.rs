//! Cryptographic primitives: ECDSA P-256 signatures, ephemeral ECDH with
//! AES-256-GCM, BLAKE2b-192 keyed header MACs, and PEM key file I/O.

use crate::error::SudpError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use blake2::digest::consts::U24;
use blake2::digest::Mac;
use blake2::{Blake2b, Blake2bMac, Digest};
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;

/// Uncompressed SEC1 P-256 point, as carried in handshake bodies.
pub const PUBKEY_SIZE: usize = 65;

/// Fixed-width ECDSA signature: r ‖ s, each 32 bytes big-endian.
pub const SIG_SIZE: usize = 64;

/// Keyed BLAKE2b output authenticating the packet header.
pub const MAC_SIZE: usize = 24;

/// AES-GCM nonce size.
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size.
pub const TAG_SIZE: usize = 16;

/// BLAKE2b keyed mode accepts keys up to 64 bytes.
const MAX_HMAC_KEY: usize = 64;

type Blake2bMac192 = Blake2bMac<U24>;
type Blake2b192 = Blake2b<U24>;

/// Sign `message` (SHA-256 digest) and return the fixed 64-byte encoding.
pub fn sign(key: &SigningKey, message: &[u8]) -> [u8; SIG_SIZE] {
    let sig: Signature = key.sign(message);
    let mut out = [0u8; SIG_SIZE];
    out.copy_from_slice(sig.to_bytes().as_slice());
    out
}

/// Verify a fixed 64-byte signature over `message`.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8; SIG_SIZE]) -> bool {
    match Signature::from_slice(signature) {
        Ok(sig) => key.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

/// BLAKE2b-192 tag over `data`.
///
/// Keyed mode when a shared HMAC key is configured; the plain hash when the
/// key is empty, matching peers configured without one.
pub fn header_mac(data: &[u8], key: &[u8]) -> Result<[u8; MAC_SIZE], SudpError> {
    let mut out = [0u8; MAC_SIZE];
    if key.is_empty() {
        let mut hasher = Blake2b192::new();
        Digest::update(&mut hasher, data);
        out.copy_from_slice(hasher.finalize().as_slice());
    } else {
        if key.len() > MAX_HMAC_KEY {
            return Err(SudpError::Config(format!(
                "hmac key of {} bytes exceeds the {} byte maximum",
                key.len(),
                MAX_HMAC_KEY
            )));
        }
        let mut mac: Blake2bMac192 = Mac::new_from_slice(key)
            .map_err(|e| SudpError::Config(format!("hmac key: {e}")))?;
        Mac::update(&mut mac, data);
        out.copy_from_slice(mac.finalize().into_bytes().as_slice());
    }
    Ok(out)
}

/// One epoch's ephemeral key material: a fresh ECDH keypair plus, once the
/// remote half arrives, the derived AES-256-GCM cipher.
pub struct EpochCipher {
    secret: EphemeralSecret,
    cipher: Option<Aes256Gcm>,
}

impl EpochCipher {
    pub fn generate() -> Self {
        Self {
            secret: EphemeralSecret::random(&mut OsRng),
            cipher: None,
        }
    }

    /// Uncompressed SEC1 encoding of the local ephemeral public key.
    pub fn public_bytes(&self) -> [u8; PUBKEY_SIZE] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; PUBKEY_SIZE];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Complete the exchange: the 32-byte shared secret becomes the
    /// AES-256-GCM key for this epoch.
    pub fn derive(&mut self, remote: &[u8]) -> Result<(), SudpError> {
        let remote = PublicKey::from_sec1_bytes(remote)
            .map_err(|_| SudpError::MalformedPacket("invalid ephemeral public key"))?;
        let shared = self.secret.diffie_hellman(&remote);
        let key = Key::<Aes256Gcm>::from_slice(shared.raw_secret_bytes().as_slice());
        self.cipher = Some(Aes256Gcm::new(key));
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal `plaintext` under a fresh random nonce. Empty AAD, 16-byte tag.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>), SudpError> {
        let cipher = self.cipher.as_ref().ok_or(SudpError::NotReady)?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SudpError::MalformedPacket("oversized payload"))?;
        Ok((nonce, ciphertext))
    }

    pub fn decrypt(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, SudpError> {
        let cipher = self.cipher.as_ref().ok_or(SudpError::NotReady)?;
        if nonce.len() != NONCE_SIZE {
            return Err(SudpError::MalformedPacket("invalid nonce size"));
        }
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SudpError::AuthFailure)
    }
}

/// Generate a fresh P-256 signing key.
pub fn generate_key() -> SigningKey {
    SigningKey::random(&mut OsRng)
}

/// Load a private key from a SEC1 "EC PRIVATE KEY" PEM file.
pub fn private_key_from_pem_file<P: AsRef<Path>>(path: P) -> Result<SigningKey, SudpError> {
    let pem = std::fs::read_to_string(&path)
        .map_err(|e| SudpError::Config(format!("reading {}: {e}", path.as_ref().display())))?;
    let secret = SecretKey::from_sec1_pem(&pem)
        .map_err(|e| SudpError::Config(format!("private key {}: {e}", path.as_ref().display())))?;
    Ok(SigningKey::from(secret))
}

/// Load a public key from an SPKI "PUBLIC KEY" PEM file.
pub fn public_key_from_pem_file<P: AsRef<Path>>(path: P) -> Result<VerifyingKey, SudpError> {
    let pem = std::fs::read_to_string(&path)
        .map_err(|e| SudpError::Config(format!("reading {}: {e}", path.as_ref().display())))?;
    let public = PublicKey::from_public_key_pem(&pem)
        .map_err(|e| SudpError::Config(format!("public key {}: {e}", path.as_ref().display())))?;
    Ok(VerifyingKey::from(public))
}

/// Mint a keypair and write the private (SEC1 PEM) and public (SPKI PEM)
/// halves to the given paths.
pub fn write_pem_keypair<P: AsRef<Path>>(private: P, public: P) -> Result<(), SudpError> {
    let secret = SecretKey::random(&mut OsRng);

    let private_pem = secret
        .to_sec1_pem(LineEnding::LF)
        .map_err(|e| SudpError::Config(format!("encoding private key: {e}")))?;
    std::fs::write(&private, private_pem.as_bytes())
        .map_err(|e| SudpError::Config(format!("writing {}: {e}", private.as_ref().display())))?;

    let public_pem = secret
        .public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| SudpError::Config(format!("encoding public key: {e}")))?;
    std::fs::write(&public, public_pem.as_bytes())
        .map_err(|e| SudpError::Config(format!("writing {}: {e}", public.as_ref().display())))?;

    Ok(())
}

/// Short key fingerprint for logs.
pub fn fingerprint(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    hex::encode(&point.as_bytes()[1..9])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let key = generate_key();
        let sig = sign(&key, b"three-message handshake");
        assert!(verify(key.verifying_key(), b"three-message handshake", &sig));
        assert!(!verify(key.verifying_key(), b"tampered", &sig));
    }

    #[test]
    fn signature_is_fixed_width() {
        let key = generate_key();
        let sig = sign(&key, b"x");
        assert_eq!(sig.len(), SIG_SIZE);
    }

    #[test]
    fn header_mac_keyed_and_unkeyed_differ() {
        let keyed = header_mac(b"0123456789abcdef0123", b"password").unwrap();
        let unkeyed = header_mac(b"0123456789abcdef0123", b"").unwrap();
        assert_ne!(keyed, unkeyed);
        assert_eq!(keyed, header_mac(b"0123456789abcdef0123", b"password").unwrap());
    }

    #[test]
    fn header_mac_rejects_oversized_key() {
        assert!(header_mac(b"data", &[0u8; 65]).is_err());
    }

    #[test]
    fn ecdh_shared_cipher_roundtrip() {
        let mut a = EpochCipher::generate();
        let mut b = EpochCipher::generate();
        assert!(!a.is_ready());
        a.derive(&b.public_bytes()).unwrap();
        b.derive(&a.public_bytes()).unwrap();
        assert!(a.is_ready() && b.is_ready());

        let (nonce, ct) = a.encrypt(b"payload").unwrap();
        assert_eq!(b.decrypt(&nonce, &ct).unwrap(), b"payload");
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let mut a = EpochCipher::generate();
        let mut b = EpochCipher::generate();
        a.derive(&b.public_bytes()).unwrap();
        b.derive(&a.public_bytes()).unwrap();

        let (nonce, mut ct) = a.encrypt(b"payload").unwrap();
        ct[0] ^= 0xff;
        assert!(matches!(b.decrypt(&nonce, &ct), Err(SudpError::AuthFailure)));
    }

    #[test]
    fn pem_keypair_roundtrip() {
        let dir = std::env::temp_dir().join("sudp_pem_test");
        std::fs::create_dir_all(&dir).unwrap();
        let private = dir.join("k_private.pem");
        let public = dir.join("k_public.pem");

        write_pem_keypair(&private, &public).unwrap();
        let sk = private_key_from_pem_file(&private).unwrap();
        let pk = public_key_from_pem_file(&public).unwrap();
        assert_eq!(sk.verifying_key(), &pk);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
