//! Thin adapter over `num_bigint::BigUint`.
//!
//! Everything the scheduler and the cryptosystem need from the arithmetic
//! core lives here: the unit of offloadable work ([`ModExpJob`]), scalar and
//! batched modular exponentiation, word/hex import-export, sampling and a
//! Miller-Rabin prime generator.

use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::RngCore;
use rayon::prelude::*;

/// Witness rounds used by [`is_probable_prime`] during key generation.
pub const MILLER_RABIN_ROUNDS: usize = 32;

const SMALL_PRIMES: [u32; 25] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// One modular exponentiation `base ^ exponent mod modulus`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModExpJob {
    pub base: BigUint,
    pub exponent: BigUint,
    pub modulus: BigUint,
}

impl ModExpJob {
    pub fn new(base: BigUint, exponent: BigUint, modulus: BigUint) -> Self {
        Self {
            base,
            exponent,
            modulus,
        }
    }

    /// Reason the job cannot be computed, if any.
    pub fn defect(&self) -> Option<&'static str> {
        if self.modulus.is_zero() {
            Some("modulus is zero")
        } else {
            None
        }
    }

    #[inline]
    pub fn compute(&self) -> BigUint {
        self.base.modpow(&self.exponent, &self.modulus)
    }
}

/// Software modexp over a batch, data-parallel across the rayon pool.
pub fn mod_exp_batch(jobs: &[ModExpJob]) -> Vec<BigUint> {
    jobs.par_iter().map(ModExpJob::compute).collect()
}

/// Build an integer from little-endian 32-bit words.
pub fn from_words(words: &[u32]) -> BigUint {
    BigUint::from_slice(words)
}

/// Little-endian 32-bit words; zero is exported as `[0]`.
pub fn to_words(value: &BigUint) -> Vec<u32> {
    let mut words = value.to_u32_digits();
    if words.is_empty() {
        words.push(0);
    }
    words
}

pub fn to_hex(value: &BigUint) -> String {
    value.to_str_radix(16)
}

/// Parse a hex string, with or without a `0x` prefix.
pub fn from_hex(hex: &str) -> Option<BigUint> {
    let digits = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    BigUint::parse_bytes(digits.as_bytes(), 16)
}

/// Uniform integer below `2^bits`.
pub fn random_bits<R: RngCore + ?Sized>(rng: &mut R, bits: u64) -> BigUint {
    if bits == 0 {
        return BigUint::zero();
    }
    let len = bits.div_ceil(8) as usize;
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);

    let excess = (len as u64) * 8 - bits;
    if let Some(top) = bytes.last_mut() {
        *top &= 0xff >> excess;
    }
    BigUint::from_bytes_le(&bytes)
}

/// Uniform integer in `[0, bound)`. `bound` must be non-zero.
pub fn random_below<R: RngCore + ?Sized>(rng: &mut R, bound: &BigUint) -> BigUint {
    debug_assert!(!bound.is_zero());
    let bits = bound.bits();
    loop {
        let candidate = random_bits(rng, bits);
        if &candidate < bound {
            return candidate;
        }
    }
}

/// Uniform unit of `Z_n^*`, or `None` when `n <= 1` leaves no unit to draw.
pub fn random_unit<R: RngCore + ?Sized>(rng: &mut R, n: &BigUint) -> Option<BigUint> {
    if n <= &BigUint::one() {
        return None;
    }
    loop {
        let candidate = random_below(rng, n);
        if !candidate.is_zero() && candidate.gcd(n).is_one() {
            return Some(candidate);
        }
    }
}

/// Paillier's `L(u) = (u - 1) / n`; zero for `u == 0`, which no valid
/// ciphertext produces.
pub fn l_function(u: &BigUint, n: &BigUint) -> BigUint {
    if u.is_zero() {
        return BigUint::zero();
    }
    (u - 1u32) / n
}

pub fn is_probable_prime<R: RngCore + ?Sized>(n: &BigUint, rounds: usize, rng: &mut R) -> bool {
    if n < &BigUint::from(2u32) {
        return false;
    }
    for p in SMALL_PRIMES {
        if n == &BigUint::from(p) {
            return true;
        }
        if (n % p).is_zero() {
            return false;
        }
    }

    // n > 97 and odd from here on
    let n_minus_one = n - 1u32;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;
    let witness_range = n - 3u32;

    'witness: for _ in 0..rounds {
        let a = random_below(rng, &witness_range) + 2u32;
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = &x * &x % n;
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Random prime of exactly `bits` bits with the two top bits set, so the
/// product of two such primes has exactly `2 * bits` bits.
pub fn generate_prime<R: RngCore + ?Sized>(rng: &mut R, bits: u64) -> BigUint {
    debug_assert!(bits >= 8);
    let top = (BigUint::one() << (bits - 1)) | (BigUint::one() << (bits - 2));
    loop {
        let candidate = random_bits(rng, bits) | &top | BigUint::one();
        if is_probable_prime(&candidate, MILLER_RABIN_ROUNDS, rng) {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::test_utils::trng;

    #[test]
    fn batch_matches_scalar_modexp() {
        let modulus = BigUint::from(1_000_000_007u64);
        let jobs: Vec<_> = (1u32..=64)
            .map(|i| ModExpJob::new(BigUint::from(i * 7919), BigUint::from(i + 3), modulus.clone()))
            .collect();

        let batched = mod_exp_batch(&jobs);
        for (job, got) in jobs.iter().zip(batched) {
            assert_eq!(got, job.compute());
        }
    }

    #[test]
    fn zero_modulus_is_a_defect() {
        let job = ModExpJob::new(BigUint::from(3u32), BigUint::from(5u32), BigUint::zero());
        assert_eq!(job.defect(), Some("modulus is zero"));
    }

    #[test]
    fn words_and_hex_import_export() {
        let value = from_words(&[0xdead_beef, 0x1]);
        assert_eq!(to_hex(&value), "1deadbeef");
        assert_eq!(to_words(&value), vec![0xdead_beef, 0x1]);
        assert_eq!(from_hex("0x1DEADBEEF"), Some(value));
        assert_eq!(to_words(&BigUint::zero()), vec![0]);
        assert_eq!(from_hex("xyz"), None);
    }

    #[test]
    fn random_bits_respects_width() {
        let mut rng = trng();
        for bits in [1u64, 7, 8, 9, 63, 130] {
            for _ in 0..32 {
                assert!(random_bits(&mut rng, bits).bits() <= bits);
            }
        }
    }

    #[test]
    fn random_unit_needs_a_modulus_above_one() {
        let mut rng = trng();
        assert_eq!(random_unit(&mut rng, &BigUint::zero()), None);
        assert_eq!(random_unit(&mut rng, &BigUint::one()), None);
        assert_eq!(random_unit(&mut rng, &BigUint::from(2u32)), Some(BigUint::one()));

        let n = BigUint::from(35u32);
        for _ in 0..32 {
            let u = random_unit(&mut rng, &n).unwrap();
            assert!(u < n && u.gcd(&n).is_one());
        }
    }

    #[test]
    fn primality_of_known_values() {
        let mut rng = trng();
        let primes = [2u64, 3, 97, 101, 7919, 1_000_000_007, 2_305_843_009_213_693_951];
        let composites = [0u64, 1, 4, 91, 561, 1_000_000_011 * 3, 4_294_967_297];
        for p in primes {
            assert!(is_probable_prime(&BigUint::from(p), 16, &mut rng), "{p}");
        }
        for c in composites {
            assert!(!is_probable_prime(&BigUint::from(c), 16, &mut rng), "{c}");
        }
    }

    #[test]
    fn generated_prime_has_exact_width() {
        let mut rng = trng();
        let p = generate_prime(&mut rng, 96);
        assert_eq!(p.bits(), 96);
        assert!(p.is_odd());
    }

    #[test]
    fn l_function_divides_exactly() {
        let n = BigUint::from(35u32);
        let u = &n * 4u32 + 1u32;
        assert_eq!(l_function(&u, &n), BigUint::from(4u32));
    }
}
