//! Paillier key material.
//!
//! Public and private keys are immutable once built and shared freely across
//! threads. Every modular exponentiation of encryption and decryption is
//! handed to a [`ModExpExecutor`] so the hybrid scheduler can take a share.

use std::sync::Arc;

use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::RngCore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    bignum::{self, ModExpJob},
    error::PaillierError,
    offload::{ModExpExecutor, OperationKind},
    runtime::GlobalExecutor,
    text::{CipherText, PlainText},
};

pub const MIN_KEY_BITS: u64 = 128;
pub const MAX_KEY_BITS: u64 = 4096;

const PRIME_SEARCH_ATTEMPTS: usize = 64;

fn check_key_size(bits: u64) -> Result<(), PaillierError> {
    if bits % 2 != 0 || !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
        return Err(PaillierError::InvalidKeySize {
            bits,
            min: MIN_KEY_BITS,
            max: MAX_KEY_BITS,
        });
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    n: BigUint,
    nsquare: BigUint,
    g: BigUint,
    bits: u64,
    /// `hs = h^n mod n^2` when DJN randomness is enabled.
    hs: Option<BigUint>,
    random_bits: u64,
}

impl PublicKey {
    fn new(n: BigUint, hs: Option<BigUint>) -> Self {
        let bits = n.bits();
        Self {
            nsquare: &n * &n,
            g: &n + 1u32,
            bits,
            hs,
            random_bits: bits / 2,
            n,
        }
    }

    pub fn n(&self) -> &BigUint {
        &self.n
    }

    pub fn nsquare(&self) -> &BigUint {
        &self.nsquare
    }

    pub fn g(&self) -> &BigUint {
        &self.g
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn is_djn(&self) -> bool {
        self.hs.is_some()
    }

    /// Modulus as little-endian 32-bit words.
    pub fn to_words(&self) -> Vec<u32> {
        bignum::to_words(&self.n)
    }

    /// Encrypt through the process-wide executor with fresh randomness.
    pub fn encrypt(self: &Arc<Self>, plain: &PlainText) -> Result<CipherText, PaillierError> {
        self.encrypt_with(plain, true, &mut rand::rng(), &GlobalExecutor)
    }

    /// `c = (1 + m*n) * obfuscator mod n^2`; with `make_secure == false` the
    /// obfuscator is omitted, which is only sound as an operand of CT + PT.
    pub fn encrypt_with<R: RngCore + ?Sized>(
        self: &Arc<Self>,
        plain: &PlainText,
        make_secure: bool,
        rng: &mut R,
        executor: &dyn ModExpExecutor,
    ) -> Result<CipherText, PaillierError> {
        if plain.is_empty() {
            return Err(PaillierError::EmptyText);
        }
        if let Some(index) = plain.values().iter().position(|m| *m >= self.n) {
            return Err(PaillierError::PlaintextOutOfRange { index });
        }

        let mut values: Vec<BigUint> = plain
            .values()
            .par_iter()
            .map(|m| (m * &self.n + 1u32) % &self.nsquare)
            .collect();

        if make_secure {
            let obfuscators = self.obfuscators(plain.len(), rng, executor)?;
            values
                .par_iter_mut()
                .zip(obfuscators)
                .for_each(|(c, r)| *c = &*c * r % &self.nsquare);
        }

        Ok(CipherText::new(Arc::clone(self), values))
    }

    /// One obfuscator per element: `hs^r` (DJN) or `r^n` for a unit `r`.
    fn obfuscators<R: RngCore + ?Sized>(
        &self,
        count: usize,
        rng: &mut R,
        executor: &dyn ModExpExecutor,
    ) -> Result<Vec<BigUint>, PaillierError> {
        let jobs = (0..count)
            .map(|_| -> Result<ModExpJob, PaillierError> {
                Ok(match &self.hs {
                    Some(hs) => ModExpJob::new(
                        hs.clone(),
                        bignum::random_bits(rng, self.random_bits),
                        self.nsquare.clone(),
                    ),
                    None => ModExpJob::new(
                        bignum::random_unit(rng, &self.n)
                            .ok_or(PaillierError::InvalidPublicKey("modulus has no units"))?,
                        self.n.clone(),
                        self.nsquare.clone(),
                    ),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(executor.mod_exp(&jobs, OperationKind::Encrypt)?)
    }

    /// `a * b mod n^2`, the ciphertext-level addition.
    pub(crate) fn raw_add(&self, a: &BigUint, b: &BigUint) -> BigUint {
        a * b % &self.nsquare
    }
}

#[derive(Serialize, Deserialize)]
struct PublicKeyRecord {
    n: String,
    hs: Option<String>,
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PublicKeyRecord {
            n: bignum::to_hex(&self.n),
            hs: self.hs.as_ref().map(bignum::to_hex),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let record = PublicKeyRecord::deserialize(deserializer)?;
        let n = bignum::from_hex(&record.n).ok_or_else(|| D::Error::custom("n is not hex"))?;
        let hs = record
            .hs
            .map(|hs| bignum::from_hex(&hs).ok_or_else(|| D::Error::custom("hs is not hex")))
            .transpose()?;
        let key = PublicKey::new(n, hs);
        key.check().map_err(D::Error::custom)?;
        Ok(key)
    }
}

impl PublicKey {
    /// Structural checks for a key that did not come from key generation.
    fn check(&self) -> Result<(), PaillierError> {
        if !self.n.is_odd() {
            return Err(PaillierError::InvalidPublicKey("n must be odd"));
        }
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&self.bits) {
            return Err(PaillierError::InvalidKeySize {
                bits: self.bits,
                min: MIN_KEY_BITS,
                max: MAX_KEY_BITS,
            });
        }
        if let Some(hs) = &self.hs {
            if hs.is_zero() || hs >= &self.nsquare {
                return Err(PaillierError::InvalidPublicKey("hs must be in (0, n^2)"));
            }
        }
        Ok(())
    }
}

pub struct PrivateKey {
    public: Arc<PublicKey>,
    p: BigUint,
    q: BigUint,
    psquare: BigUint,
    qsquare: BigUint,
    lambda: BigUint,
    mu: BigUint,
    /// `p^-1 mod q`
    pinverse: BigUint,
    hp: BigUint,
    hq: BigUint,
    crt: bool,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("bits", &self.public.bits)
            .field("crt", &self.crt)
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    fn new(public: Arc<PublicKey>, p: BigUint, q: BigUint) -> Result<Self, PaillierError> {
        let n = public.n();
        let p1 = &p - 1u32;
        let q1 = &q - 1u32;
        let lambda = p1.lcm(&q1);

        let u = public.g().modpow(&lambda, public.nsquare());
        let mu = bignum::l_function(&u, n)
            .modinv(n)
            .ok_or(PaillierError::KeyGeneration("L(g^lambda) is not invertible mod n"))?;

        let psquare = &p * &p;
        let qsquare = &q * &q;
        let pinverse = p
            .modinv(&q)
            .ok_or(PaillierError::KeyGeneration("p is not invertible mod q"))?;
        let hp = Self::h_function(public.g(), &p, &psquare)?;
        let hq = Self::h_function(public.g(), &q, &qsquare)?;

        Ok(Self {
            public,
            p,
            q,
            psquare,
            qsquare,
            lambda,
            mu,
            pinverse,
            hp,
            hq,
            crt: true,
        })
    }

    /// `h_x = L_x(g^(x-1) mod x^2)^-1 mod x`
    fn h_function(g: &BigUint, x: &BigUint, xsquare: &BigUint) -> Result<BigUint, PaillierError> {
        let u = g.modpow(&(x - 1u32), xsquare);
        bignum::l_function(&u, x)
            .modinv(x)
            .ok_or(PaillierError::KeyGeneration("CRT constant is not invertible"))
    }

    pub fn public_key(&self) -> &Arc<PublicKey> {
        &self.public
    }

    pub fn lambda(&self) -> &BigUint {
        &self.lambda
    }

    pub fn uses_crt(&self) -> bool {
        self.crt
    }

    /// Switch between CRT decryption (default) and `L(c^lambda)*mu mod n`.
    pub fn with_crt(mut self, crt: bool) -> Self {
        self.crt = crt;
        self
    }

    pub fn decrypt(&self, cipher: &CipherText) -> Result<PlainText, PaillierError> {
        self.decrypt_with(cipher, &GlobalExecutor)
    }

    pub fn decrypt_with(
        &self,
        cipher: &CipherText,
        executor: &dyn ModExpExecutor,
    ) -> Result<PlainText, PaillierError> {
        if cipher.is_empty() {
            return Err(PaillierError::EmptyText);
        }
        if !same_key(cipher.public_key(), &self.public) {
            return Err(PaillierError::KeyMismatch);
        }

        let values = if self.crt {
            self.decrypt_crt(cipher.values(), executor)?
        } else {
            self.decrypt_plain(cipher.values(), executor)?
        };
        Ok(PlainText::new(values))
    }

    fn decrypt_plain(
        &self,
        values: &[BigUint],
        executor: &dyn ModExpExecutor,
    ) -> Result<Vec<BigUint>, PaillierError> {
        let n = self.public.n();
        let jobs: Vec<_> = values
            .iter()
            .map(|c| ModExpJob::new(c.clone(), self.lambda.clone(), self.public.nsquare().clone()))
            .collect();
        let powers = executor.mod_exp(&jobs, OperationKind::Decrypt)?;
        Ok(powers
            .par_iter()
            .map(|u| bignum::l_function(u, n) * &self.mu % n)
            .collect())
    }

    /// Both half-size exponentiations of every element go out as one batch:
    /// all `mod p^2` jobs first, then all `mod q^2` jobs.
    fn decrypt_crt(
        &self,
        values: &[BigUint],
        executor: &dyn ModExpExecutor,
    ) -> Result<Vec<BigUint>, PaillierError> {
        let p1 = &self.p - 1u32;
        let q1 = &self.q - 1u32;
        let jobs: Vec<_> = values
            .iter()
            .map(|c| ModExpJob::new(c % &self.psquare, p1.clone(), self.psquare.clone()))
            .chain(
                values
                    .iter()
                    .map(|c| ModExpJob::new(c % &self.qsquare, q1.clone(), self.qsquare.clone())),
            )
            .collect();
        let powers = executor.mod_exp(&jobs, OperationKind::Decrypt)?;
        let (mod_p, mod_q) = powers.split_at(values.len());

        Ok(mod_p
            .par_iter()
            .zip(mod_q.par_iter())
            .map(|(up, uq)| {
                let mp = bignum::l_function(up, &self.p) * &self.hp % &self.p;
                let mq = bignum::l_function(uq, &self.q) * &self.hq % &self.q;
                self.recombine(&mp, &mq)
            })
            .collect())
    }

    /// `m = mp + p * ((mq - mp) * p^-1 mod q)`
    fn recombine(&self, mp: &BigUint, mq: &BigUint) -> BigUint {
        let mp_mod_q = mp % &self.q;
        let diff = if *mq >= mp_mod_q {
            mq - &mp_mod_q
        } else {
            mq + &self.q - &mp_mod_q
        };
        mp + &self.p * (diff * &self.pinverse % &self.q)
    }
}

pub(crate) fn same_key(a: &Arc<PublicKey>, b: &Arc<PublicKey>) -> bool {
    Arc::ptr_eq(a, b) || a.n == b.n
}

#[derive(Debug)]
pub struct KeyPair {
    pub public_key: Arc<PublicKey>,
    pub private_key: PrivateKey,
}

impl KeyPair {
    /// Generate an `n_length`-bit key pair from the thread-local RNG.
    pub fn generate(n_length: u64, enable_djn: bool) -> Result<Self, PaillierError> {
        Self::generate_with_rng(&mut rand::rng(), n_length, enable_djn)
    }

    pub fn generate_with_rng<R: RngCore + ?Sized>(
        rng: &mut R,
        n_length: u64,
        enable_djn: bool,
    ) -> Result<Self, PaillierError> {
        check_key_size(n_length)?;
        let half = n_length / 2;

        for attempt in 0..PRIME_SEARCH_ATTEMPTS {
            let p = bignum::generate_prime(rng, half);
            let q = bignum::generate_prime(rng, half);
            if p == q {
                continue;
            }
            let n = &p * &q;
            if n.bits() != n_length || !n.gcd(&((&p - 1u32) * (&q - 1u32))).is_one() {
                debug!(attempt, "rejected prime pair");
                continue;
            }
            return Self::assemble(p, q, enable_djn, rng);
        }
        Err(PaillierError::KeyGeneration("no suitable prime pair found"))
    }

    /// Deterministic key pair from known primes, without DJN.
    pub fn from_primes(p: BigUint, q: BigUint) -> Result<Self, PaillierError> {
        let mut rng = rand::rng();
        let prime = |x: &BigUint, rng: &mut rand::rngs::ThreadRng| {
            bignum::is_probable_prime(x, bignum::MILLER_RABIN_ROUNDS, rng)
        };
        if p == q || !prime(&p, &mut rng) || !prime(&q, &mut rng) {
            return Err(PaillierError::KeyGeneration("p and q must be distinct primes"));
        }
        let n = &p * &q;
        if !n.gcd(&((&p - 1u32) * (&q - 1u32))).is_one() {
            return Err(PaillierError::KeyGeneration("gcd(n, phi(n)) != 1"));
        }
        Self::build(p, q, None)
    }

    fn assemble<R: RngCore + ?Sized>(
        p: BigUint,
        q: BigUint,
        enable_djn: bool,
        rng: &mut R,
    ) -> Result<Self, PaillierError> {
        let hs = if enable_djn {
            let n = &p * &q;
            let nsquare = &n * &n;
            let x = bignum::random_unit(rng, &n)
                .ok_or(PaillierError::KeyGeneration("modulus has no units"))?;
            let h = &n - (&x * &x % &n);
            Some(h.modpow(&n, &nsquare))
        } else {
            None
        };
        Self::build(p, q, hs)
    }

    fn build(p: BigUint, q: BigUint, hs: Option<BigUint>) -> Result<Self, PaillierError> {
        // keep p < q so the CRT recombination starts from the smaller prime
        let (p, q) = if p < q { (p, q) } else { (q, p) };
        let public_key = Arc::new(PublicKey::new(&p * &q, hs));
        let private_key = PrivateKey::new(Arc::clone(&public_key), p, q)?;
        Ok(Self {
            public_key,
            private_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::{offload::SoftwareExecutor, test_utils::trng};

    fn small_pair() -> KeyPair {
        KeyPair::from_primes(BigUint::from(1_000_003u32), BigUint::from(999_983u32)).unwrap()
    }

    fn plain(values: &[u64]) -> PlainText {
        PlainText::new(values.iter().copied().map(BigUint::from).collect())
    }

    #[test]
    fn key_size_is_checked() {
        let mut rng = trng();
        for bits in [0, 64, 127, 130 + 1, 8192] {
            assert!(matches!(
                KeyPair::generate_with_rng(&mut rng, bits, false),
                Err(PaillierError::InvalidKeySize { .. })
            ));
        }
    }

    #[test]
    fn generated_modulus_has_requested_size() {
        let mut rng = trng();
        for djn in [false, true] {
            let pair = KeyPair::generate_with_rng(&mut rng, 256, djn).unwrap();
            assert_eq!(pair.public_key.n().bits(), 256);
            assert_eq!(pair.public_key.bits(), 256);
            assert_eq!(pair.public_key.is_djn(), djn);
            assert_eq!(pair.public_key.g(), &(pair.public_key.n() + 1u32));
        }
    }

    #[test]
    fn encrypt_decrypt_both_decryption_paths() {
        let mut rng = trng();
        let pair = KeyPair::generate_with_rng(&mut rng, 256, true).unwrap();
        let pt = plain(&[0, 1, 42, u64::MAX]);

        let ct = pair
            .public_key
            .encrypt_with(&pt, true, &mut rng, &SoftwareExecutor)
            .unwrap();
        assert_eq!(pair.private_key.decrypt_with(&ct, &SoftwareExecutor).unwrap(), pt);

        let plain_path = pair.private_key.with_crt(false);
        assert!(!plain_path.uses_crt());
        assert_eq!(plain_path.decrypt_with(&ct, &SoftwareExecutor).unwrap(), pt);
    }

    #[test]
    fn encryption_is_randomized_unless_insecure() {
        let mut rng = trng();
        let pair = small_pair();
        let pt = plain(&[7, 7]);

        let secure = pair
            .public_key
            .encrypt_with(&pt, true, &mut rng, &SoftwareExecutor)
            .unwrap();
        assert_ne!(secure.values()[0], secure.values()[1]);

        let bare = pair
            .public_key
            .encrypt_with(&pt, false, &mut rng, &SoftwareExecutor)
            .unwrap();
        assert_eq!(bare.values()[0], bare.values()[1]);
        assert_eq!(pair.private_key.decrypt_with(&bare, &SoftwareExecutor).unwrap(), pt);
    }

    #[test]
    fn plaintext_must_be_below_modulus() {
        let pair = small_pair();
        let n = pair.public_key.n().clone();
        let pt = PlainText::new(vec![BigUint::from(3u32), n]);
        assert_eq!(
            pair.public_key
                .encrypt_with(&pt, true, &mut trng(), &SoftwareExecutor)
                .unwrap_err(),
            PaillierError::PlaintextOutOfRange { index: 1 }
        );
        assert_eq!(
            pair.public_key
                .encrypt_with(&PlainText::new(vec![]), true, &mut trng(), &SoftwareExecutor)
                .unwrap_err(),
            PaillierError::EmptyText
        );
    }

    #[test]
    fn foreign_ciphertext_is_rejected() {
        let mut rng = trng();
        let a = small_pair();
        let b = KeyPair::generate_with_rng(&mut rng, 128, false).unwrap();
        let ct = b
            .public_key
            .encrypt_with(&plain(&[1]), true, &mut rng, &SoftwareExecutor)
            .unwrap();
        assert_eq!(
            a.private_key.decrypt_with(&ct, &SoftwareExecutor).unwrap_err(),
            PaillierError::KeyMismatch
        );
    }

    #[test]
    fn from_primes_rejects_bad_input() {
        let p = BigUint::from(1_000_003u32);
        assert!(KeyPair::from_primes(p.clone(), p).is_err());
        assert!(KeyPair::from_primes(BigUint::one(), BigUint::from(7u32)).is_err());
    }

    #[test]
    fn from_primes_rejects_composites() {
        assert_eq!(
            KeyPair::from_primes(BigUint::from(9u32), BigUint::from(5u32)).unwrap_err(),
            PaillierError::KeyGeneration("p and q must be distinct primes")
        );
        assert!(KeyPair::from_primes(BigUint::from(1_000_003u32), BigUint::from(999_981u32)).is_err());
        assert!(KeyPair::from_primes(BigUint::from(7u32), BigUint::from(5u32)).is_ok());
    }

    #[test]
    fn public_key_json_rejects_malformed_moduli() {
        for json in [
            r#"{"n":"0","hs":null}"#,
            r#"{"n":"1","hs":null}"#,
            r#"{"n":"f423f","hs":null}"#,
        ] {
            assert!(serde_json::from_str::<PublicKey>(json).is_err(), "{json}");
        }

        let pair = KeyPair::generate_with_rng(&mut trng(), 128, false).unwrap();
        let mut even = pair.public_key.n().clone();
        even.set_bit(0, false);
        let json = format!(r#"{{"n":"{}","hs":null}}"#, bignum::to_hex(&even));
        assert!(serde_json::from_str::<PublicKey>(&json).is_err());

        let degenerate = Arc::new(PublicKey::new(BigUint::one(), None));
        assert_eq!(
            degenerate
                .encrypt_with(&plain(&[0]), true, &mut trng(), &SoftwareExecutor)
                .unwrap_err(),
            PaillierError::InvalidPublicKey("modulus has no units")
        );

        let nsquare = bignum::to_hex(pair.public_key.nsquare());
        let json = format!(r#"{{"n":"{}","hs":"{nsquare}"}}"#, bignum::to_hex(pair.public_key.n()));
        assert!(serde_json::from_str::<PublicKey>(&json).is_err());
    }

    #[test]
    fn public_key_json() {
        let pair = KeyPair::generate_with_rng(&mut trng(), 128, true).unwrap();
        let json = serde_json::to_string(pair.public_key.as_ref()).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, pair.public_key.as_ref());
    }
}
