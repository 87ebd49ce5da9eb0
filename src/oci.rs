//! # OCI Image Format Data Model
//!
//! Serde types for the subset of the OCI Image Format consumed and produced
//! by this crate: descriptors, image manifests, and image configs.
//!
//! ## Canonical JSON
//!
//! Digest stability requires a single byte encoding for every document this
//! crate writes. The canonical form is `serde_json`'s compact encoding with:
//!
//! - fields serialized in the order they are declared below (the order the
//!   OCI schema lists them),
//! - absent optional fields omitted entirely,
//! - timestamps rendered as RFC 3339 strings,
//! - no indentation or trailing whitespace, UTF-8 without BOM.
//!
//! Serializing the same value twice always yields identical bytes, so the
//! digest of a config or manifest is stable across runs and processes.
//!
//! ## Layer bookkeeping
//!
//! A manifest's `layers`, its config's `rootfs.diff_ids`, and the non-empty
//! entries of `history` are parallel arrays. [`Image::non_empty_history`]
//! supports checking that correspondence; the mutator refuses to commit an
//! image that violates it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Description of a blob: identity, size, and intended interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(rename = "mediaType")]
    pub media_type: String,

    /// Digest of the referenced content.
    pub digest: Digest,

    /// Size of the referenced content in bytes.
    pub size: i64,

    /// Optional alternate source URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    /// Arbitrary annotation metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Builds a plain descriptor with no URLs or annotations.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
        }
    }
}

/// Top-level image manifest: one config plus an ordered list of layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Image manifest schema version, always 2.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    /// Descriptor of the image config blob.
    pub config: Descriptor,

    /// Layer descriptors, base layer first.
    pub layers: Vec<Descriptor>,

    /// Arbitrary annotation metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Image config document referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    /// Author of the image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Target CPU architecture.
    pub architecture: String,

    /// Target operating system.
    pub os: String,

    /// Runtime configuration for containers created from this image.
    #[serde(default)]
    pub config: ImageConfig,

    /// Filesystem layer identities.
    pub rootfs: RootFs,

    /// Build history, parallel to the layer list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

impl Image {
    /// Number of history entries that correspond to a real layer.
    pub fn non_empty_history(&self) -> usize {
        self.history.iter().filter(|h| !h.is_empty_layer()).count()
    }
}

impl Default for Image {
    fn default() -> Self {
        Self {
            created: None,
            author: None,
            architecture: String::new(),
            os: String::new(),
            config: ImageConfig::default(),
            rootfs: RootFs::default(),
            history: Vec::new(),
        }
    }
}

/// Runtime configuration embedded in an image config.
///
/// JSON keys are capitalized per the OCI image-spec schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// User (and optionally group) to run as, e.g. `"user:group"`.
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Set of ports to expose, keyed `"<port>/<proto>"` with empty values.
    #[serde(rename = "ExposedPorts", skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,

    /// Environment variables as `"NAME=value"` entries.
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Entrypoint command list.
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,

    /// Default command arguments.
    #[serde(rename = "Cmd", default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    /// Set of volume mount points with empty values.
    #[serde(rename = "Volumes", skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,

    /// Working directory for the entrypoint.
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    /// Arbitrary label metadata.
    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Signal sent to stop a container.
    #[serde(rename = "StopSignal", skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

/// Identity of the image root filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `"layers"`.
    #[serde(rename = "type")]
    pub fs_type: String,

    /// Digests of the *uncompressed* layer tar streams, base layer first.
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One entry of the image build history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    /// When the entry was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    /// Command that produced the entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// Author of the entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Free-form comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Whether the entry corresponds to no layer (metadata-only change).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

impl History {
    /// Whether this entry is marked as producing no layer.
    pub fn is_empty_layer(&self) -> bool {
        self.empty_layer.unwrap_or(false)
    }
}
