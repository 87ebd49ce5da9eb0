//! Constants for the OCI image-editor core.
//!
//! All layout paths, media types, and limits are defined here to ensure
//! consistency and prevent magic strings throughout the codebase.

// =============================================================================
// Layout Paths
// =============================================================================

/// Name of the layout marker file at the root of a CAS directory.
pub const LAYOUT_FILE: &str = "oci-layout";

/// Subdirectory holding content-addressed blobs.
pub const BLOB_DIRECTORY: &str = "blobs";

/// Subdirectory holding named references.
pub const REF_DIRECTORY: &str = "refs";

/// Prefix of per-session scratch directories inside a layout.
pub const SCRATCH_PREFIX: &str = ".temp-";

/// Name of the advisory lock file inside a scratch directory.
pub const SCRATCH_LOCK_FILE: &str = "lock";

// =============================================================================
// OCI Spec Versions
// =============================================================================

/// OCI Image Layout version written to and accepted from the marker file.
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

/// Manifest `schemaVersion` produced and consumed by the mutator.
pub const MANIFEST_SCHEMA_VERSION: u32 = 2;

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI Image Manifest media type.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Config media type.
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// OCI Layer media type (gzip compressed).
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI Layer media type (uncompressed).
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// OCI non-distributable layer media type (gzip compressed).
pub const MEDIA_TYPE_LAYER_NON_DISTRIBUTABLE_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// OCI non-distributable layer media type (uncompressed).
pub const MEDIA_TYPE_LAYER_NON_DISTRIBUTABLE_TAR: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";

// =============================================================================
// I/O
// =============================================================================

/// Chunk size for streamed blob I/O. Cancellation is honored between chunks,
/// so this bounds cancellation latency.
pub const IO_CHUNK_SIZE: usize = 32 * 1024;

/// Maximum manifest blob size the mutator will deserialize (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum config blob size the mutator will deserialize (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;
