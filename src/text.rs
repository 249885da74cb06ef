//! Plaintext and ciphertext batches and the homomorphic operations on them.

use std::sync::Arc;

use itertools::Itertools;
use num_bigint::BigUint;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    bignum::{self, ModExpJob},
    error::PaillierError,
    key::{PublicKey, same_key},
    offload::{ModExpExecutor, OperationKind},
    runtime::GlobalExecutor,
};

/// `values` rotated right by `shift` (left for negative shifts).
fn rotated<T: Clone>(values: &[T], shift: i64) -> Result<Vec<T>, PaillierError> {
    let size = values.len();
    if size == 1 {
        return Err(PaillierError::RotateSingle);
    }
    if shift.unsigned_abs() > size as u64 {
        return Err(PaillierError::RotationOutOfRange { shift, size });
    }

    let mut out = values.to_vec();
    let steps = shift.unsigned_abs() as usize % size.max(1);
    if shift > 0 {
        out.rotate_right(steps);
    } else {
        out.rotate_left(steps);
    }
    Ok(out)
}

fn element_at(values: &[BigUint], index: usize) -> Result<&BigUint, PaillierError> {
    values.get(index).ok_or(PaillierError::IndexOutOfRange {
        index,
        size: values.len(),
    })
}

/// Lowest 32-bit word of every element, the flat export format.
fn low_words(values: &[BigUint]) -> Vec<u32> {
    values
        .iter()
        .map(|v| v.iter_u32_digits().next().unwrap_or(0))
        .collect()
}

/// `rhs` must match `lhs` in length or be a single element broadcast over it.
fn check_operand_size(lhs: usize, rhs: usize) -> Result<(), PaillierError> {
    if lhs == 0 {
        return Err(PaillierError::EmptyText);
    }
    if rhs != lhs && rhs != 1 {
        return Err(PaillierError::SizeMismatch { lhs, rhs });
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlainText {
    values: Vec<BigUint>,
}

impl PlainText {
    pub fn new(values: Vec<BigUint>) -> Self {
        Self { values }
    }

    /// One element per word.
    pub fn from_u32s(words: &[u32]) -> Self {
        Self::new(words.iter().copied().map(BigUint::from).collect())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[BigUint] {
        &self.values
    }

    pub fn into_values(self) -> Vec<BigUint> {
        self.values
    }

    pub fn element(&self, index: usize) -> Result<&BigUint, PaillierError> {
        element_at(&self.values, index)
    }

    /// Little-endian 32-bit words of one element.
    pub fn element_words(&self, index: usize) -> Result<Vec<u32>, PaillierError> {
        self.element(index).map(bignum::to_words)
    }

    pub fn low_words(&self) -> Vec<u32> {
        low_words(&self.values)
    }

    pub fn rotate(&self, shift: i64) -> Result<Self, PaillierError> {
        rotated(&self.values, shift).map(Self::new)
    }

    /// PT + CT, same as `cipher.add_plain(self)`.
    pub fn add_cipher(&self, cipher: &CipherText) -> Result<CipherText, PaillierError> {
        cipher.add_plain(self)
    }

    /// PT * CT, same as `cipher.mul_plain(self)`.
    pub fn mul_cipher(&self, cipher: &CipherText) -> Result<CipherText, PaillierError> {
        cipher.mul_plain(self)
    }
}

impl From<Vec<BigUint>> for PlainText {
    fn from(values: Vec<BigUint>) -> Self {
        Self::new(values)
    }
}

impl From<BigUint> for PlainText {
    fn from(value: BigUint) -> Self {
        Self::new(vec![value])
    }
}

/// A batch of ciphertexts under one public key.
#[derive(Clone, Debug)]
pub struct CipherText {
    key: Arc<PublicKey>,
    values: Vec<BigUint>,
}

impl PartialEq for CipherText {
    fn eq(&self, other: &Self) -> bool {
        same_key(&self.key, &other.key) && self.values == other.values
    }
}

impl Eq for CipherText {}

#[derive(Serialize, Deserialize)]
struct CipherRecord {
    values: Vec<String>,
}

impl CipherText {
    pub fn new(key: Arc<PublicKey>, values: Vec<BigUint>) -> Self {
        Self { key, values }
    }

    pub fn public_key(&self) -> &Arc<PublicKey> {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[BigUint] {
        &self.values
    }

    pub fn element(&self, index: usize) -> Result<&BigUint, PaillierError> {
        element_at(&self.values, index)
    }

    pub fn element_words(&self, index: usize) -> Result<Vec<u32>, PaillierError> {
        self.element(index).map(bignum::to_words)
    }

    pub fn low_words(&self) -> Vec<u32> {
        low_words(&self.values)
    }

    /// Single-element ciphertext holding element `index`.
    pub fn cipher_at(&self, index: usize) -> Result<Self, PaillierError> {
        let value = self.element(index)?.clone();
        Ok(Self::new(Arc::clone(&self.key), vec![value]))
    }

    pub fn rotate(&self, shift: i64) -> Result<Self, PaillierError> {
        rotated(&self.values, shift).map(|values| Self::new(Arc::clone(&self.key), values))
    }

    /// CT + CT: elementwise product mod `n^2`, decrypting to the sum.
    pub fn add(&self, rhs: &CipherText) -> Result<Self, PaillierError> {
        check_operand_size(self.len(), rhs.len())?;
        if !same_key(&self.key, &rhs.key) {
            return Err(PaillierError::KeyMismatch);
        }

        let key = &self.key;
        let values: Vec<BigUint> = if rhs.len() == 1 {
            let b = &rhs.values[0];
            self.values.par_iter().map(|a| key.raw_add(a, b)).collect()
        } else {
            self.values
                .par_iter()
                .zip(rhs.values.par_iter())
                .map(|(a, b)| key.raw_add(a, b))
                .collect()
        };
        Ok(Self::new(Arc::clone(key), values))
    }

    /// CT + PT: the plaintext is encrypted without obfuscation, then added.
    pub fn add_plain(&self, rhs: &PlainText) -> Result<Self, PaillierError> {
        self.add_plain_with(rhs, &GlobalExecutor)
    }

    pub fn add_plain_with(
        &self,
        rhs: &PlainText,
        executor: &dyn ModExpExecutor,
    ) -> Result<Self, PaillierError> {
        check_operand_size(self.len(), rhs.len())?;
        let encoded = self
            .key
            .encrypt_with(rhs, false, &mut rand::rng(), executor)?;
        self.add(&encoded)
    }

    /// CT * PT: `c^m mod n^2`, decrypting to the product.
    pub fn mul_plain(&self, rhs: &PlainText) -> Result<Self, PaillierError> {
        self.mul_plain_with(rhs, &GlobalExecutor)
    }

    pub fn mul_plain_with(
        &self,
        rhs: &PlainText,
        executor: &dyn ModExpExecutor,
    ) -> Result<Self, PaillierError> {
        check_operand_size(self.len(), rhs.len())?;

        let nsquare = self.key.nsquare();
        let job = |c: &BigUint, m: &BigUint| ModExpJob::new(c.clone(), m.clone(), nsquare.clone());
        let jobs: Vec<_> = if rhs.len() == 1 {
            let m = &rhs.values()[0];
            self.values.iter().map(|c| job(c, m)).collect()
        } else {
            self.values
                .iter()
                .zip_eq(rhs.values())
                .map(|(c, m)| job(c, m))
                .collect()
        };

        let values = executor.mod_exp(&jobs, OperationKind::Multiply)?;
        Ok(Self::new(Arc::clone(&self.key), values))
    }

    /// Hex JSON of the elements; the key is not included.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&CipherRecord {
            values: self.values.iter().map(bignum::to_hex).collect(),
        })
    }

    pub fn from_json(key: Arc<PublicKey>, json: &str) -> serde_json::Result<Self> {
        use serde::de::Error;

        let record: CipherRecord = serde_json::from_str(json)?;
        let values = record
            .values
            .iter()
            .map(|hex| {
                bignum::from_hex(hex)
                    .ok_or_else(|| serde_json::Error::custom(format!("`{hex}` is not hex")))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self::new(key, values))
    }
}
