//! Flat, handle-based API for callers that cannot hold Rust objects.
//!
//! Every object lives in a [`HandleTable`] owned by the [`Session`]; callers
//! hold plain integer handles and destroy them explicitly. All cryptographic
//! work goes through the process-wide executor selected with
//! [`crate::runtime::initialize_context`].

use std::sync::Arc;

use tracing::debug;

use crate::{
    error::SessionError,
    handles::{CipherTextId, HandleTable, KeyPairId, PlainTextId},
    key::KeyPair,
    text::{CipherText, PlainText},
};

#[derive(Default)]
pub struct Session {
    keys: HandleTable<KeyPairId, KeyPair>,
    plains: HandleTable<PlainTextId, PlainText>,
    ciphers: HandleTable<CipherTextId, CipherText>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keypair_create(
        &mut self,
        n_length: u64,
        enable_djn: bool,
    ) -> Result<KeyPairId, SessionError> {
        let pair = KeyPair::generate(n_length, enable_djn)?;
        let id = self.keys.insert(pair);
        debug!(%id, n_length, enable_djn, "key pair created");
        Ok(id)
    }

    /// Adopt an existing key pair.
    pub fn keypair_insert(&mut self, pair: KeyPair) -> KeyPairId {
        self.keys.insert(pair)
    }

    pub fn keypair(&self, id: KeyPairId) -> Result<&KeyPair, SessionError> {
        Ok(self.keys.get(id)?)
    }

    pub fn keypair_destroy(&mut self, id: KeyPairId) -> Result<(), SessionError> {
        self.keys.remove(id)?;
        Ok(())
    }

    /// Public modulus as little-endian 32-bit words.
    pub fn public_key_words(&self, id: KeyPairId) -> Result<Vec<u32>, SessionError> {
        Ok(self.keys.get(id)?.public_key.to_words())
    }

    pub fn public_key_json(&self, id: KeyPairId) -> Result<String, SessionError> {
        Ok(serde_json::to_string(self.keys.get(id)?.public_key.as_ref())?)
    }

    /// One plaintext element per word.
    pub fn plaintext_create(&mut self, words: &[u32]) -> PlainTextId {
        self.plains.insert(PlainText::from_u32s(words))
    }

    pub fn plaintext(&self, id: PlainTextId) -> Result<&PlainText, SessionError> {
        Ok(self.plains.get(id)?)
    }

    pub fn plaintext_destroy(&mut self, id: PlainTextId) -> Result<(), SessionError> {
        self.plains.remove(id)?;
        Ok(())
    }

    pub fn plaintext_len(&self, id: PlainTextId) -> Result<usize, SessionError> {
        Ok(self.plains.get(id)?.len())
    }

    /// Lowest 32-bit word of every element.
    pub fn plaintext_export(&self, id: PlainTextId) -> Result<Vec<u32>, SessionError> {
        Ok(self.plains.get(id)?.low_words())
    }

    pub fn ciphertext(&self, id: CipherTextId) -> Result<&CipherText, SessionError> {
        Ok(self.ciphers.get(id)?)
    }

    pub fn ciphertext_len(&self, id: CipherTextId) -> Result<usize, SessionError> {
        Ok(self.ciphers.get(id)?.len())
    }

    /// Lowest 32-bit word of every element.
    pub fn ciphertext_export(&self, id: CipherTextId) -> Result<Vec<u32>, SessionError> {
        Ok(self.ciphers.get(id)?.low_words())
    }

    pub fn ciphertext_destroy(&mut self, id: CipherTextId) -> Result<(), SessionError> {
        self.ciphers.remove(id)?;
        Ok(())
    }

    pub fn ciphertext_save_json(&self, id: CipherTextId) -> Result<String, SessionError> {
        Ok(self.ciphers.get(id)?.to_json()?)
    }

    /// Load a ciphertext saved with [`Self::ciphertext_save_json`] under the
    /// public key of `keypair`.
    pub fn ciphertext_load_json(
        &mut self,
        keypair: KeyPairId,
        json: &str,
    ) -> Result<CipherTextId, SessionError> {
        let key = Arc::clone(&self.keys.get(keypair)?.public_key);
        let cipher = CipherText::from_json(key, json)?;
        Ok(self.ciphers.insert(cipher))
    }

    pub fn encrypt(
        &mut self,
        keypair: KeyPairId,
        plain: PlainTextId,
    ) -> Result<CipherTextId, SessionError> {
        let pair = self.keys.get(keypair)?;
        let cipher = pair.public_key.encrypt(self.plains.get(plain)?)?;
        Ok(self.ciphers.insert(cipher))
    }

    pub fn decrypt(
        &mut self,
        keypair: KeyPairId,
        cipher: CipherTextId,
    ) -> Result<PlainTextId, SessionError> {
        let pair = self.keys.get(keypair)?;
        let plain = pair.private_key.decrypt(self.ciphers.get(cipher)?)?;
        Ok(self.plains.insert(plain))
    }

    /// enc(x) + enc(y)
    pub fn add(
        &mut self,
        lhs: CipherTextId,
        rhs: CipherTextId,
    ) -> Result<CipherTextId, SessionError> {
        let sum = self.ciphers.get(lhs)?.add(self.ciphers.get(rhs)?)?;
        Ok(self.ciphers.insert(sum))
    }

    /// enc(x) + y
    pub fn add_plain(
        &mut self,
        lhs: CipherTextId,
        rhs: PlainTextId,
    ) -> Result<CipherTextId, SessionError> {
        let sum = self.ciphers.get(lhs)?.add_plain(self.plains.get(rhs)?)?;
        Ok(self.ciphers.insert(sum))
    }

    /// enc(x) * y
    pub fn multiply(
        &mut self,
        lhs: CipherTextId,
        rhs: PlainTextId,
    ) -> Result<CipherTextId, SessionError> {
        let product = self.ciphers.get(lhs)?.mul_plain(self.plains.get(rhs)?)?;
        Ok(self.ciphers.insert(product))
    }

    /// Objects currently alive, as `(key pairs, plaintexts, ciphertexts)`.
    pub fn live_objects(&self) -> (usize, usize, usize) {
        (self.keys.len(), self.plains.len(), self.ciphers.len())
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;
    use serial_test::serial;
    use test_log::test;

    use super::*;
    use crate::handles::{Handle, HandleError};

    fn session_with_key() -> (Session, KeyPairId) {
        let mut session = Session::new();
        let pair =
            KeyPair::from_primes(BigUint::from(1_000_003u32), BigUint::from(999_983u32)).unwrap();
        let id = session.keypair_insert(pair);
        (session, id)
    }

    #[test]
    #[serial]
    fn encrypt_add_multiply_decrypt() {
        let (mut s, key) = session_with_key();
        let x = s.plaintext_create(&[1, 2, 3]);
        let y = s.plaintext_create(&[10, 20, 30]);

        let cx = s.encrypt(key, x).unwrap();
        let cy = s.encrypt(key, y).unwrap();
        assert_eq!(s.ciphertext_len(cx).unwrap(), 3);

        let sum = s.add(cx, cy).unwrap();
        let out = s.decrypt(key, sum).unwrap();
        assert_eq!(s.plaintext_export(out).unwrap(), vec![11, 22, 33]);

        let sum2 = s.add_plain(cx, y).unwrap();
        let out2 = s.decrypt(key, sum2).unwrap();
        assert_eq!(s.plaintext_export(out2).unwrap(), vec![11, 22, 33]);

        let product = s.multiply(cy, x).unwrap();
        let out3 = s.decrypt(key, product).unwrap();
        assert_eq!(s.plaintext_export(out3).unwrap(), vec![10, 40, 90]);
        assert_eq!(s.plaintext_len(out3).unwrap(), 3);
    }

    #[test]
    fn destroyed_handles_are_not_found() {
        let (mut s, key) = session_with_key();
        let pt = s.plaintext_create(&[7]);
        s.plaintext_destroy(pt).unwrap();

        let err = s.encrypt(key, pt).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handle(HandleError::NotFound { kind: "plaintext", id }) if id == pt.raw()
        ));

        s.keypair_destroy(key).unwrap();
        assert!(s.public_key_words(key).is_err());
        assert_eq!(s.live_objects(), (0, 0, 0));
    }

    #[test]
    #[serial]
    fn size_mismatch_surfaces_as_paillier_error() {
        let (mut s, key) = session_with_key();
        let five = s.plaintext_create(&[1, 2, 3, 4, 5]);
        let three = s.plaintext_create(&[1, 2, 3]);
        let c5 = s.encrypt(key, five).unwrap();
        assert!(matches!(
            s.multiply(c5, three),
            Err(SessionError::Paillier(crate::PaillierError::SizeMismatch { lhs: 5, rhs: 3 }))
        ));
    }

    #[test]
    #[serial]
    fn ciphertext_json_round_trip_through_handles() {
        let (mut s, key) = session_with_key();
        let pt = s.plaintext_create(&[123]);
        let ct = s.encrypt(key, pt).unwrap();

        let json = s.ciphertext_save_json(ct).unwrap();
        let loaded = s.ciphertext_load_json(key, &json).unwrap();
        assert_eq!(s.ciphertext(loaded).unwrap(), s.ciphertext(ct).unwrap());
        assert_eq!(s.ciphertext_export(loaded).unwrap(), s.ciphertext_export(ct).unwrap());
        assert!(s.public_key_json(key).unwrap().contains("\"n\""));
        s.ciphertext_destroy(ct).unwrap();
        assert!(s.ciphertext_len(ct).is_err());
    }
}
