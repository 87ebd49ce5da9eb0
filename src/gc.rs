//! # Reference-Graph Garbage Collection
//!
//! The CAS itself knows nothing about manifests; it only removes abandoned
//! scratch directories via [`Engine::clean`]. This module adds the
//! image-aware sweep: every blob reachable from a stored reference
//! (transitively, through manifest config and layer descriptors) is live,
//! and everything else is deleted.
//!
//! Reachability never cycles: children are addressed by the digest of
//! content that cannot mention its parent, so the descriptor graph is a DAG
//! and a visited set is enough.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cas::Engine;
use crate::constants::MEDIA_TYPE_IMAGE_MANIFEST;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::oci::{Descriptor, Manifest};

/// Statistics from a garbage collection sweep.
#[derive(Debug, Clone)]
pub struct SweepStats {
    /// Number of blobs removed.
    pub removed_count: u64,
    /// Bytes freed.
    pub freed_bytes: u64,
}

/// Deletes every blob not reachable from a stored reference, then removes
/// abandoned scratch directories.
///
/// A reference whose graph points at a missing blob is tolerated: the hole
/// is logged and the walk continues, so one damaged image cannot block
/// collection of the rest.
pub fn sweep(engine: &Engine, token: &CancellationToken) -> Result<SweepStats> {
    let mut reachable: HashSet<Digest> = HashSet::new();
    let mut pending: Vec<Descriptor> = Vec::new();
    for name in engine.list_references(token)? {
        pending.push(engine.get_reference(token, &name)?);
    }

    while let Some(descriptor) = pending.pop() {
        if token.is_cancelled() {
            return Err(Error::Cancelled { operation: "sweep" });
        }
        if !reachable.insert(descriptor.digest.clone()) {
            continue;
        }
        if descriptor.media_type != MEDIA_TYPE_IMAGE_MANIFEST {
            continue;
        }
        let bytes = match engine.read_blob(token, &descriptor.digest) {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                warn!("reference graph points at missing blob {}", descriptor.digest);
                continue;
            }
            Err(err) => return Err(err),
        };
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        pending.push(manifest.config);
        pending.extend(manifest.layers);
    }
    debug!("{} blobs reachable from references", reachable.len());

    let mut removed_count = 0u64;
    let mut freed_bytes = 0u64;
    for digest in engine.list_blobs(token)? {
        if reachable.contains(&digest) {
            continue;
        }
        if let Ok(size) = engine.blob_size(token, &digest) {
            freed_bytes += size;
        }
        engine.delete_blob(token, &digest)?;
        removed_count += 1;
    }

    engine.clean(token)?;

    info!("garbage collection removed {removed_count} blobs ({freed_bytes} bytes)");
    Ok(SweepStats {
        removed_count,
        freed_bytes,
    })
}
