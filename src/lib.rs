//! # ociedit
//!
//! **Editor core for on-disk OCI image layouts**
//!
//! This crate provides the two subsystems at the heart of a container-image
//! editor: a directory-backed content-addressable store for blobs and named
//! references, and a mutator that composes a new manifest graph on top of an
//! existing one. Everything above them (CLI dispatch, human-readable
//! rendering, tar authoring) is a consumer of this crate, not part of it.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           ociedit                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                       Mutator                             │  │
//! │  │   add(layer) / set(config) ──► commit() ──► Descriptor    │  │
//! │  │   caches manifest + config, stages changes in memory      │  │
//! │  └──────────────────────────┬────────────────────────────────┘  │
//! │                             │ blobs in / blobs out              │
//! │  ┌──────────────────────────┴────────────────────────────────┐  │
//! │  │                       Engine (CAS)                        │  │
//! │  │   digest-addressed blobs │ named references │ clean()     │  │
//! │  │   atomic rename writes   │ advisory-locked scratch dirs   │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                             │                                   │
//! │                  oci-layout │ blobs/sha256/… │ refs/…           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store sees only byte streams and descriptors; manifest semantics
//! live entirely in the mutator and the [`gc`] sweep.
//!
//! # Key Properties
//!
//! - **Content addressing**: a blob's key is the SHA-256 of its bytes,
//!   verified on read.
//! - **Atomicity**: every mutation is staged in a scratch directory on the
//!   same filesystem and renamed into place; readers never observe partial
//!   state.
//! - **Crash-safe GC**: scratch directories carry advisory locks, so
//!   [`Engine::clean`] removes only directories whose owning session is
//!   gone.
//! - **Read-only friendly**: opening and reading a layout never writes;
//!   write attempts on read-only media fail with a distinct error kind.
//! - **Cancellation**: long-running operations take an ambient
//!   [`tokio_util::sync::CancellationToken`] and honor it between 32 KiB
//!   chunks.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ociedit::{Engine, History, Mutator};
//! use tokio_util::sync::CancellationToken;
//!
//! fn main() -> ociedit::Result<()> {
//!     let token = CancellationToken::new();
//!
//!     Engine::create("./image")?;
//!     let engine = Arc::new(Engine::open("./image")?);
//!
//!     let source = engine.get_reference(&token, "latest")?;
//!     let mut mutator = Mutator::new(Arc::clone(&engine), source)?;
//!     mutator.add(&token, layer_tar_stream, History {
//!         comment: Some("add application files".to_string()),
//!         ..Default::default()
//!     })?;
//!     let committed = mutator.commit(&token)?;
//!
//!     engine.put_reference(&token, "latest", &committed)?;
//!     engine.close()
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod cas;
mod constants;
mod digest;
mod error;
mod mutate;
mod oci;

/// Reference-graph garbage collection over a CAS engine.
pub mod gc;

// =============================================================================
// Public API
// =============================================================================

pub use cas::{BlobReader, Engine};
pub use digest::{Algorithm, Digest, Digester, BLOB_ALGORITHM};
pub use error::{Error, Result};
pub use mutate::{Meta, Mutator};
pub use oci::{Descriptor, History, Image, ImageConfig, Manifest, RootFs};

/// Layout and media-type constants shared with collaborators.
pub use constants::{
    IMAGE_LAYOUT_VERSION, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_MANIFEST,
    MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_LAYER_NON_DISTRIBUTABLE_GZIP,
    MEDIA_TYPE_LAYER_NON_DISTRIBUTABLE_TAR, MEDIA_TYPE_LAYER_TAR,
};
