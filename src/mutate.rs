//! # Image Mutator
//!
//! A stateful editing session over an image manifest stored in the CAS.
//! Starting from a source manifest descriptor, a [`Mutator`] accumulates
//! changes in memory (appended layers, replaced runtime config, annotation
//! updates) and [`Mutator::commit`] persists a fresh config and manifest
//! through the engine, returning the new manifest descriptor.
//!
//! The store itself is immutable: original blobs are never touched, and
//! naming the committed manifest (writing a reference) is the caller's
//! concern.
//!
//! ## Session Lifecycle
//!
//! ```text
//! ┌───────┐ first use ┌────────┐  add/set  ┌───────┐  commit   ┌───────┐
//! │ Fresh │ ────────► │ Loaded │ ────────► │ Dirty │ ────────► │ Clean │
//! └───────┘           └────────┘           └───────┘           └───────┘
//!                                              ▲                   │
//!                                              └─────── add/set ───┘
//! ```
//!
//! The manifest and config blobs are loaded and deserialized once, on the
//! first operation that needs them, and cached for the lifetime of the
//! session. A committed session stays usable; further edits continue from
//! the just-committed state.
//!
//! ## Layer Bookkeeping
//!
//! `manifest.layers`, `config.rootfs.diff_ids`, and the non-empty entries
//! of `config.history` stay in lockstep: appending a layer grows all three,
//! a config-only change appends a history entry marked `empty_layer`. The
//! mutator refuses to load or commit an image whose bookkeeping is out of
//! sync.

use std::collections::BTreeMap;
use std::io::{self, BufReader, Read};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::bufread::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cas::Engine;
use crate::constants::{
    MANIFEST_SCHEMA_VERSION, MAX_CONFIG_SIZE, MAX_MANIFEST_SIZE, MEDIA_TYPE_IMAGE_CONFIG,
    MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_NON_DISTRIBUTABLE_GZIP,
    MEDIA_TYPE_LAYER_NON_DISTRIBUTABLE_TAR, MEDIA_TYPE_LAYER_TAR,
};
use crate::digest::{Digester, BLOB_ALGORITHM};
use crate::error::{Error, Result};
use crate::oci::{Descriptor, History, Image, ImageConfig, Manifest};

/// Media types a manifest layer may carry.
const LAYER_MEDIA_TYPES: [&str; 4] = [
    MEDIA_TYPE_LAYER_GZIP,
    MEDIA_TYPE_LAYER_TAR,
    MEDIA_TYPE_LAYER_NON_DISTRIBUTABLE_GZIP,
    MEDIA_TYPE_LAYER_NON_DISTRIBUTABLE_TAR,
];

/// Top-level image metadata merged by [`Mutator::set`].
///
/// Only `Some` fields overwrite the cached config; `None` leaves the
/// existing value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Meta {
    /// Image creation timestamp.
    pub created: Option<DateTime<Utc>>,
    /// Image author.
    pub author: Option<String>,
    /// Target CPU architecture.
    pub architecture: Option<String>,
    /// Target operating system.
    pub os: Option<String>,
}

/// In-memory mutable copies of the manifest graph under edit.
struct Cache {
    manifest: Manifest,
    config: Image,
}

/// An editing session bound to a source manifest descriptor.
pub struct Mutator {
    engine: Arc<Engine>,
    source: Descriptor,
    cache: Option<Cache>,
    dirty: bool,
}

impl Mutator {
    /// Starts a session editing the image identified by `source`.
    ///
    /// Fails unless `source` describes an image manifest. No I/O happens
    /// until the first operation that needs the cached manifest.
    pub fn new(engine: Arc<Engine>, source: Descriptor) -> Result<Mutator> {
        if source.media_type != MEDIA_TYPE_IMAGE_MANIFEST {
            return Err(Error::UnexpectedMediaType {
                media_type: source.media_type.clone(),
                expected: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
            });
        }
        Ok(Mutator {
            engine,
            source,
            cache: None,
            dirty: false,
        })
    }

    /// Descriptor of the manifest this session currently edits.
    ///
    /// Updated by [`Mutator::commit`] so a continued session chains from
    /// the committed manifest.
    pub fn source(&self) -> &Descriptor {
        &self.source
    }

    /// Whether the session holds uncommitted changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The cached manifest, loading it on first use.
    pub fn manifest(&mut self, token: &CancellationToken) -> Result<&Manifest> {
        Ok(&self.ensure_cache(token)?.manifest)
    }

    /// The cached image config, loading it on first use.
    pub fn config(&mut self, token: &CancellationToken) -> Result<&Image> {
        Ok(&self.ensure_cache(token)?.config)
    }

    /// Appends a distributable gzip-compressed layer.
    ///
    /// `layer` must be the *uncompressed* tar stream; the mutator computes
    /// its diff ID and gzip-compresses it into the store in a single pass.
    /// `history` is recorded with `empty_layer` forced to `false`.
    pub fn add<R: Read>(
        &mut self,
        token: &CancellationToken,
        layer: R,
        history: History,
    ) -> Result<()> {
        self.append_layer(token, layer, MEDIA_TYPE_LAYER_GZIP, history)
    }

    /// Appends a non-distributable gzip-compressed layer.
    ///
    /// Identical to [`Mutator::add`] apart from the media type.
    pub fn add_non_distributable<R: Read>(
        &mut self,
        token: &CancellationToken,
        layer: R,
        history: History,
    ) -> Result<()> {
        self.append_layer(token, layer, MEDIA_TYPE_LAYER_NON_DISTRIBUTABLE_GZIP, history)
    }

    /// Replaces the embedded runtime config and manifest annotations.
    ///
    /// `meta` fields that are `Some` overwrite the top-level config
    /// metadata. No layer is added; `history` is recorded with
    /// `empty_layer` forced to `true`.
    pub fn set(
        &mut self,
        token: &CancellationToken,
        config: ImageConfig,
        meta: Meta,
        annotations: Option<BTreeMap<String, String>>,
        mut history: History,
    ) -> Result<()> {
        let cache = self.ensure_cache(token)?;

        cache.config.config = config;
        if let Some(created) = meta.created {
            cache.config.created = Some(created);
        }
        if let Some(author) = meta.author {
            cache.config.author = Some(author);
        }
        if let Some(architecture) = meta.architecture {
            cache.config.architecture = architecture;
        }
        if let Some(os) = meta.os {
            cache.config.os = os;
        }
        cache.manifest.annotations = annotations;

        history.empty_layer = Some(true);
        cache.config.history.push(history);
        self.dirty = true;
        Ok(())
    }

    /// Persists the staged config and manifest, returning the descriptor of
    /// the new manifest.
    ///
    /// The session's cache is retained and its source updated, so further
    /// edits continue from the committed state. References are not touched.
    pub fn commit(&mut self, token: &CancellationToken) -> Result<Descriptor> {
        let engine = Arc::clone(&self.engine);
        let cache = self.ensure_cache(token)?;
        check_layer_bookkeeping(cache)?;

        let (config_digest, config_size) = engine.put_blob_json(token, &cache.config)?;
        cache.manifest.config =
            Descriptor::new(MEDIA_TYPE_IMAGE_CONFIG, config_digest, config_size);

        let (manifest_digest, manifest_size) = engine.put_blob_json(token, &cache.manifest)?;
        let descriptor =
            Descriptor::new(MEDIA_TYPE_IMAGE_MANIFEST, manifest_digest, manifest_size);

        debug!("committed manifest {}", descriptor.digest);
        self.source = descriptor.clone();
        self.dirty = false;
        Ok(descriptor)
    }

    fn append_layer<R: Read>(
        &mut self,
        token: &CancellationToken,
        layer: R,
        media_type: &str,
        mut history: History,
    ) -> Result<()> {
        self.ensure_cache(token)?;

        // Single pass: hash the uncompressed stream for the diff ID while
        // the store hashes and persists the compressed bytes.
        let engine = Arc::clone(&self.engine);
        let mut diff_digester = BLOB_ALGORITHM.digester();
        let tee = DiffIdReader {
            inner: layer,
            digester: &mut diff_digester,
        };
        let compressed = GzEncoder::new(BufReader::new(tee), Compression::default());
        let (digest, size) = engine.put_blob(token, compressed)?;
        let diff_id = diff_digester.finalize();

        let cache = self.ensure_cache(token)?;
        debug!("appended layer {digest} (diff id {diff_id})");
        cache
            .manifest
            .layers
            .push(Descriptor::new(media_type, digest, size));
        cache.config.rootfs.diff_ids.push(diff_id);
        history.empty_layer = Some(false);
        cache.config.history.push(history);
        self.dirty = true;
        Ok(())
    }

    /// Loads and caches the manifest and config blobs on first use.
    fn ensure_cache(&mut self, token: &CancellationToken) -> Result<&mut Cache> {
        let cache = match self.cache.take() {
            Some(cache) => cache,
            None => self.load(token)?,
        };
        Ok(self.cache.insert(cache))
    }

    fn load(&self, token: &CancellationToken) -> Result<Cache> {
        let manifest_bytes = self.engine.read_blob(token, &self.source.digest)?;
        if manifest_bytes.len() > MAX_MANIFEST_SIZE {
            return Err(Error::InvalidImage(format!(
                "manifest exceeds {MAX_MANIFEST_SIZE} bytes"
            )));
        }
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;
        if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(Error::InvalidImage(format!(
                "unsupported manifest schema version {}",
                manifest.schema_version
            )));
        }
        if manifest.config.media_type != MEDIA_TYPE_IMAGE_CONFIG {
            return Err(Error::UnexpectedMediaType {
                media_type: manifest.config.media_type.clone(),
                expected: MEDIA_TYPE_IMAGE_CONFIG.to_string(),
            });
        }

        let config_bytes = self.engine.read_blob(token, &manifest.config.digest)?;
        if config_bytes.len() > MAX_CONFIG_SIZE {
            return Err(Error::InvalidImage(format!(
                "config exceeds {MAX_CONFIG_SIZE} bytes"
            )));
        }
        let config: Image = serde_json::from_slice(&config_bytes)?;

        let cache = Cache { manifest, config };
        check_layer_bookkeeping(&cache)?;
        debug!(
            "cached manifest {} ({} layers)",
            self.source.digest,
            cache.manifest.layers.len()
        );
        Ok(cache)
    }
}

/// Verifies the parallel-array invariant between layers, diff IDs, and
/// history, plus layer media types.
fn check_layer_bookkeeping(cache: &Cache) -> Result<()> {
    let layers = cache.manifest.layers.len();
    let diff_ids = cache.config.rootfs.diff_ids.len();
    let history = cache.config.non_empty_history();
    if layers != diff_ids {
        return Err(Error::InvalidImage(format!(
            "{layers} manifest layers but {diff_ids} rootfs diff ids"
        )));
    }
    if layers != history {
        return Err(Error::InvalidImage(format!(
            "{layers} manifest layers but {history} non-empty history entries"
        )));
    }
    for layer in &cache.manifest.layers {
        if !LAYER_MEDIA_TYPES.contains(&layer.media_type.as_str()) {
            return Err(Error::InvalidImage(format!(
                "'{}' is not a layer media type",
                layer.media_type
            )));
        }
    }
    Ok(())
}

/// Reader adapter that feeds every byte it passes through into a digester,
/// so the uncompressed stream can be hashed while a compressor consumes it.
struct DiffIdReader<'a, R> {
    inner: R,
    digester: &'a mut Digester,
}

impl<R: Read> Read for DiffIdReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}
