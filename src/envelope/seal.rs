//! Sealing the catalog key for a recipient
//!
//! ```text
//! seal(recipient_pk, key || iv):
//!   eph_sk, eph_pk = X25519 keypair
//!   shared = X25519(eph_sk, recipient_pk)
//!   enc_key = SHA-256("relaymail seal key" || shared || eph_pk || recipient_pk)
//!   nonce   = SHA-256("relaymail seal nonce" || shared || eph_pk)[..12]
//!   return eph_pk || ChaCha20-Poly1305(enc_key, nonce, key || iv, aad = eph_pk)
//! ```

use super::cipher::SymmetricKey;
use super::EnvelopeError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

const KEY_CONTEXT: &[u8] = b"relaymail seal key";
const NONCE_CONTEXT: &[u8] = b"relaymail seal nonce";
const TAG_SIZE: usize = 16;

/// Fresh X25519 keypair for a mailbox owner
pub fn generate_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Parse a hex encoded X25519 public key
pub fn parse_public_key(hex_key: &str) -> Result<PublicKey, EnvelopeError> {
    Ok(PublicKey::from(decode_32(hex_key)?))
}

/// Parse a hex encoded X25519 secret key
pub fn parse_secret_key(hex_key: &str) -> Result<StaticSecret, EnvelopeError> {
    Ok(StaticSecret::from(decode_32(hex_key)?))
}

fn decode_32(hex_key: &str) -> Result<[u8; 32], EnvelopeError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| EnvelopeError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| EnvelopeError::InvalidKey("expected 32 bytes".to_string()))
}

fn derive(shared: &SharedSecret, eph_pk: &PublicKey, recipient_pk: &PublicKey) -> ([u8; 32], [u8; 12]) {
    let enc_key: [u8; 32] = Sha256::new()
        .chain_update(KEY_CONTEXT)
        .chain_update(shared.as_bytes())
        .chain_update(eph_pk.as_bytes())
        .chain_update(recipient_pk.as_bytes())
        .finalize()
        .into();

    let nonce_full = Sha256::new()
        .chain_update(NONCE_CONTEXT)
        .chain_update(shared.as_bytes())
        .chain_update(eph_pk.as_bytes())
        .finalize();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&nonce_full[..12]);

    (enc_key, nonce)
}

/// Seal a catalog key so only the holder of `recipient`'s secret can open it
pub fn seal_key(recipient: &PublicKey, key: &SymmetricKey) -> Result<Vec<u8>, EnvelopeError> {
    let eph_sk = EphemeralSecret::random_from_rng(OsRng);
    let eph_pk = PublicKey::from(&eph_sk);
    let shared = eph_sk.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(EnvelopeError::InvalidKey(
            "recipient key is a low-order point".to_string(),
        ));
    }

    let (enc_key, nonce) = derive(&shared, &eph_pk, recipient);
    let plaintext = key.to_bytes();
    let ciphertext = ChaCha20Poly1305::new(Key::from_slice(&enc_key))
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: eph_pk.as_bytes(),
            },
        )
        .map_err(|_| EnvelopeError::Seal)?;

    let mut out = Vec::with_capacity(32 + ciphertext.len());
    out.extend_from_slice(eph_pk.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a key sealed with [`seal_key`]
pub fn open_key(secret: &StaticSecret, sealed: &[u8]) -> Result<SymmetricKey, EnvelopeError> {
    if sealed.len() < 32 + TAG_SIZE {
        return Err(EnvelopeError::Unseal);
    }

    let mut eph_bytes = [0u8; 32];
    eph_bytes.copy_from_slice(&sealed[..32]);
    let eph_pk = PublicKey::from(eph_bytes);
    let recipient_pk = PublicKey::from(secret);

    let shared = secret.diffie_hellman(&eph_pk);
    let (enc_key, nonce) = derive(&shared, &eph_pk, &recipient_pk);

    let plaintext = ChaCha20Poly1305::new(Key::from_slice(&enc_key))
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &sealed[32..],
                aad: &sealed[..32],
            },
        )
        .map_err(|_| EnvelopeError::Unseal)?;

    SymmetricKey::from_bytes(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let (secret, public) = generate_keypair();
        let key = SymmetricKey::generate();

        let sealed = seal_key(&public, &key).unwrap();
        assert_eq!(sealed.len(), 32 + 48 + TAG_SIZE);
        assert_eq!(open_key(&secret, &sealed).unwrap(), key);
    }

    #[test]
    fn test_sealing_is_randomised() {
        let (_, public) = generate_keypair();
        let key = SymmetricKey::generate();
        assert_ne!(
            seal_key(&public, &key).unwrap(),
            seal_key(&public, &key).unwrap()
        );
    }

    #[test]
    fn test_wrong_recipient_cannot_open() {
        let (_, public) = generate_keypair();
        let (other, _) = generate_keypair();
        let sealed = seal_key(&public, &SymmetricKey::generate()).unwrap();
        assert!(matches!(open_key(&other, &sealed), Err(EnvelopeError::Unseal)));
    }

    #[test]
    fn test_tampered_seal_rejected() {
        let (secret, public) = generate_keypair();
        let mut sealed = seal_key(&public, &SymmetricKey::generate()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(open_key(&secret, &sealed).is_err());
        assert!(open_key(&secret, &sealed[..20]).is_err());
    }

    #[test]
    fn test_hex_keys() {
        let (secret, public) = generate_keypair();
        let parsed = parse_public_key(&hex::encode(public.as_bytes())).unwrap();
        assert_eq!(parsed, public);

        let secret_again = parse_secret_key(&hex::encode(secret.to_bytes())).unwrap();
        assert_eq!(PublicKey::from(&secret_again), public);

        assert!(parse_public_key("abcd").is_err());
        assert!(parse_public_key("zz").is_err());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let zero = PublicKey::from([0u8; 32]);
        assert!(seal_key(&zero, &SymmetricKey::generate()).is_err());
    }
}
