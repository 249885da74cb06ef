//! Typed integer handles over slab-allocated objects.
//!
//! A handle packs the slab slot with a per-table generation, so a handle to
//! a destroyed object keeps failing with [`HandleError::NotFound`] even after
//! its slot has been reused.

use std::{fmt, marker::PhantomData};

use slab::Slab;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("no {kind} with handle {id}")]
    NotFound { kind: &'static str, id: u64 },
}

/// Handle type stored in a [`HandleTable`].
pub trait Handle: Copy + fmt::Debug {
    const KIND: &'static str;

    fn from_raw(raw: u64) -> Self;

    fn raw(self) -> u64;
}

macro_rules! handle_type {
    ($name:ident, $kind:literal) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl Handle for $name {
            const KIND: &'static str = $kind;

            fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{:#x}", $kind, self.0)
            }
        }
    };
}

handle_type!(KeyPairId, "key pair");
handle_type!(PlainTextId, "plaintext");
handle_type!(CipherTextId, "ciphertext");

struct Entry<T> {
    generation: u32,
    data: T,
}

pub struct HandleTable<K: Handle, T> {
    data: Slab<Entry<T>>,
    generation: u32,
    _p: PhantomData<K>,
}

impl<K: Handle, T> Default for HandleTable<K, T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<K: Handle, T> HandleTable<K, T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Slab::with_capacity(capacity),
            generation: 0,
            _p: PhantomData,
        }
    }

    fn split(key: K) -> (usize, u32) {
        let raw = key.raw();
        ((raw & u64::from(u32::MAX)) as usize, (raw >> 32) as u32)
    }

    fn not_found(key: K) -> HandleError {
        HandleError::NotFound {
            kind: K::KIND,
            id: key.raw(),
        }
    }

    pub fn insert(&mut self, data: T) -> K {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let slot = self.data.insert(Entry { generation, data });
        K::from_raw((u64::from(generation) << 32) | slot as u64)
    }

    pub fn get(&self, key: K) -> Result<&T, HandleError> {
        let (slot, generation) = Self::split(key);
        match self.data.get(slot) {
            Some(entry) if entry.generation == generation => Ok(&entry.data),
            _ => Err(Self::not_found(key)),
        }
    }

    pub fn remove(&mut self, key: K) -> Result<T, HandleError> {
        self.get(key)?;
        let (slot, _) = Self::split(key);
        Ok(self.data.remove(slot).data)
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_ok()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
