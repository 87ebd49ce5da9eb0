//! Cryptographic digests for content addressing.
//!
//! A digest is an `(algorithm, hex)` pair with the canonical textual form
//! `"<algo>:<hex>"`. The store addresses all blobs with [`BLOB_ALGORITHM`];
//! references may embed digests of any algorithm listed in [`Algorithm`].
//!
//! Digest strings are validated before use: the algorithm must be known and
//! the hash must be lowercase hex of the exact length the algorithm
//! produces. This prevents path traversal when digests are turned into
//! blob paths.

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha384, Sha512};

use crate::error::{Error, Result};

/// The algorithm used for every content-addressed path in the store.
pub const BLOB_ALGORITHM: Algorithm = Algorithm::Sha256;

/// Digest algorithms understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    /// Textual algorithm name as it appears in digest strings and on disk.
    pub const fn as_str(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the lowercase hex encoding this algorithm produces.
    pub const fn hex_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha384 => 96,
            Algorithm::Sha512 => 128,
        }
    }

    /// Returns a streaming hasher for this algorithm.
    pub fn digester(self) -> Digester {
        let state = match self {
            Algorithm::Sha256 => State::Sha256(Sha256::new()),
            Algorithm::Sha384 => State::Sha384(Sha384::new()),
            Algorithm::Sha512 => State::Sha512(Sha512::new()),
        };
        Digester { state }
    }

    /// Convenience one-shot digest of an in-memory byte slice.
    pub fn digest(self, bytes: &[u8]) -> Digest {
        let mut digester = self.digester();
        digester.update(bytes);
        digester.finalize()
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(Error::InvalidDigest {
                digest: s.to_string(),
                reason: format!("unknown algorithm '{s}'"),
            }),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated content digest.
///
/// Ordered and hashable so digests can key sets and maps during garbage
/// collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Builds a digest from parts, validating the hex encoding.
    pub fn new(algorithm: Algorithm, hex: impl Into<String>) -> Result<Self> {
        let hex = hex.into();
        if hex.len() != algorithm.hex_len() {
            return Err(Error::InvalidDigest {
                digest: format!("{algorithm}:{hex}"),
                reason: format!(
                    "expected {} hex characters for {algorithm}, got {}",
                    algorithm.hex_len(),
                    hex.len()
                ),
            });
        }
        if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(Error::InvalidDigest {
                digest: format!("{algorithm}:{hex}"),
                reason: "hash must be lowercase hex".to_string(),
            });
        }
        Ok(Self { algorithm, hex })
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex encoding of the hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, hex) = s.split_once(':').ok_or_else(|| Error::InvalidDigest {
            digest: s.to_string(),
            reason: "missing ':' separator".to_string(),
        })?;
        Digest::new(algo.parse()?, hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug)]
enum State {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

/// Incremental hasher producing a [`Digest`].
///
/// Implements [`std::io::Write`] so it can sit behind `io::copy` or tee
/// adapters when hashing streams.
#[derive(Debug)]
pub struct Digester {
    state: State,
}

impl Digester {
    /// Feeds bytes into the hash state.
    pub fn update(&mut self, bytes: &[u8]) {
        match &mut self.state {
            State::Sha256(h) => h.update(bytes),
            State::Sha384(h) => h.update(bytes),
            State::Sha512(h) => h.update(bytes),
        }
    }

    /// Consumes the hasher and returns the final digest.
    pub fn finalize(self) -> Digest {
        let (algorithm, hex) = match self.state {
            State::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            State::Sha384(h) => (Algorithm::Sha384, hex::encode(h.finalize())),
            State::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest { algorithm, hex }
    }
}

impl io::Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
