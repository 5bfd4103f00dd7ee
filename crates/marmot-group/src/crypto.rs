//! Primitives: HKDF-SHA256 derivation, ChaCha20-Poly1305 AEAD, BIP-340 signatures
//! and NIP-44 sealing to a member's encryption key.

use std::sync::LazyLock;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use marmot_storage_traits::Secret;
use nostr::nips::nip44;
use nostr::secp256k1::{Keypair, Message, Secp256k1, XOnlyPublicKey, schnorr};
use nostr::{Keys, PublicKey, SecretKey};
use sha2::{Digest, Sha256};

use crate::constant::PROTOCOL_LABEL;
use crate::error::Error;

static SECP: LazyLock<Secp256k1<nostr::secp256k1::All>> = LazyLock::new(Secp256k1::new);

/// 32 bytes of key material
pub type Key32 = Secret<[u8; 32]>;

/// Fill `N` bytes from the OS RNG
pub fn random_bytes<const N: usize>() -> Result<[u8; N], Error> {
    let mut out = [0u8; N];
    getrandom::fill(&mut out).map_err(|e| Error::Crypto(e.to_string()))?;
    Ok(out)
}

/// SHA-256 over the concatenation of `parts`, each length-prefixed
pub fn hash(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// HKDF-Extract with `salt`
pub fn extract(salt: &[u8], ikm: &[u8]) -> Key32 {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    let mut out = [0u8; 32];
    out.copy_from_slice(&prk);
    Secret::new(out)
}

/// HKDF-Expand of `secret` under a labelled, context-bound info string
pub fn expand(secret: &[u8; 32], label: &str, context: &[u8]) -> Result<Key32, Error> {
    let hk = Hkdf::<Sha256>::from_prk(secret)
        .map_err(|e| Error::Crypto(format!("HKDF PRK rejected: {e}")))?;
    let mut info = Vec::with_capacity(PROTOCOL_LABEL.len() + label.len() + context.len() + 2);
    info.extend_from_slice(PROTOCOL_LABEL.as_bytes());
    info.push(0x00);
    info.extend_from_slice(label.as_bytes());
    info.push(0x00);
    info.extend_from_slice(context);

    let mut out = [0u8; 32];
    hk.expand(&info, &mut out)
        .map_err(|e| Error::Crypto(format!("HKDF expansion failed: {e}")))?;
    Ok(Secret::new(out))
}

/// AEAD seal
pub fn seal(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {e}")))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| Error::Crypto(format!("Encryption failed: {e}")))
}

/// AEAD open; any failure is an authentication failure
pub fn open(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| Error::AuthenticationFailure("AEAD tag mismatch".to_string()))
}

/// BIP-340 signature over a 32-byte digest, hex encoded
pub fn sign(keys: &Keys, digest: &[u8; 32]) -> Result<String, Error> {
    let secret = hex::decode(keys.secret_key().to_secret_hex())?;
    let keypair = Keypair::from_seckey_slice(&SECP, &secret)
        .map_err(|e| Error::Crypto(format!("invalid signing key: {e}")))?;
    let signature = SECP.sign_schnorr_no_aux_rand(&Message::from_digest(*digest), &keypair);
    Ok(hex::encode(signature.serialize()))
}

/// Verify a hex BIP-340 signature made by `public_key` over `digest`
pub fn verify(public_key: &PublicKey, digest: &[u8; 32], signature: &str) -> Result<(), Error> {
    let bad = |reason: &str| Error::AuthenticationFailure(format!("signature: {reason}"));
    let sig_bytes = hex::decode(signature).map_err(|_| bad("not hex"))?;
    let signature = schnorr::Signature::from_slice(&sig_bytes).map_err(|_| bad("malformed"))?;
    let key_bytes = hex::decode(public_key.to_hex())?;
    let xonly = XOnlyPublicKey::from_slice(&key_bytes).map_err(|_| bad("bad public key"))?;
    SECP.verify_schnorr(&signature, &Message::from_digest(*digest), &xonly)
        .map_err(|_| bad("does not verify"))
}

/// Rebuild a key pair from stored secret bytes
pub fn keys_from_secret(secret: &[u8; 32]) -> Result<Keys, Error> {
    Ok(Keys::new(SecretKey::from_slice(secret)?))
}

/// Secret bytes of a key pair, for storage
pub fn secret_of(keys: &Keys) -> Result<Key32, Error> {
    let bytes = hex::decode(keys.secret_key().to_secret_hex())?;
    let mut out = [0u8; 32];
    if bytes.len() != 32 {
        return Err(Error::Crypto("secret key is not 32 bytes".to_string()));
    }
    out.copy_from_slice(&bytes);
    Ok(Secret::new(out))
}

/// NIP-44 encrypt `plaintext` from `sender` to `recipient`
pub fn seal_to(sender: &Keys, recipient: &PublicKey, plaintext: &[u8]) -> Result<String, Error> {
    Ok(nip44::encrypt(
        sender.secret_key(),
        recipient,
        plaintext,
        nip44::Version::default(),
    )?)
}

/// NIP-44 decrypt a payload sealed by [`seal_to`]
pub fn open_from(recipient: &Keys, sender: &PublicKey, payload: &str) -> Result<Vec<u8>, Error> {
    nip44::decrypt_to_bytes(recipient.secret_key(), sender, payload)
        .map_err(|e| Error::AuthenticationFailure(format!("sealed payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keys = Keys::generate();
        let digest = hash(&[b"hello"]);
        let sig = sign(&keys, &digest).unwrap();
        verify(&keys.public_key(), &digest, &sig).unwrap();

        let other = hash(&[b"hellO"]);
        assert!(matches!(
            verify(&keys.public_key(), &other, &sig),
            Err(Error::AuthenticationFailure(_))
        ));
        assert!(matches!(
            verify(&Keys::generate().public_key(), &digest, &sig),
            Err(Error::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn test_hash_is_length_prefixed() {
        assert_ne!(hash(&[b"ab", b"c"]), hash(&[b"a", b"bc"]));
    }

    #[test]
    fn test_expand_is_label_separated() {
        let secret = [7u8; 32];
        let a = expand(&secret, "key", b"").unwrap();
        let b = expand(&secret, "nonce", b"").unwrap();
        let a2 = expand(&secret, "key", b"").unwrap();
        assert_ne!(a.expose(), b.expose());
        assert_eq!(a.expose(), a2.expose());
    }

    #[test]
    fn test_aead_rejects_wrong_aad() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let ct = seal(&key, &nonce, b"aad", b"secret").unwrap();
        assert_eq!(open(&key, &nonce, b"aad", &ct).unwrap(), b"secret");
        assert!(matches!(
            open(&key, &nonce, b"other", &ct),
            Err(Error::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn test_seal_to_roundtrip() {
        let sender = Keys::generate();
        let recipient = Keys::generate();
        let payload = seal_to(&sender, &recipient.public_key(), b"joiner").unwrap();
        let opened = open_from(&recipient, &sender.public_key(), &payload).unwrap();
        assert_eq!(opened, b"joiner");

        let stranger = Keys::generate();
        assert!(open_from(&stranger, &sender.public_key(), &payload).is_err());
    }

    #[test]
    fn test_secret_roundtrip() {
        let keys = Keys::generate();
        let secret = secret_of(&keys).unwrap();
        let rebuilt = keys_from_secret(secret.expose()).unwrap();
        assert_eq!(rebuilt.public_key(), keys.public_key());
    }
}
