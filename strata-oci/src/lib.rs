//! OCI image to rootfs materialization.
//!
//! Pulls an image from a registry and reconstructs its layered filesystem
//! as a plain directory tree, applying OCI whiteouts and remapping file
//! ownership for user namespaces.
//!
//! The flow is [`Puller::pull`] → [`PulledImage::extract`] (or
//! [`PulledImage::digest`]). The registry itself sits behind the
//! [`Registry`] / [`ImageSource`] traits; [`OciRegistry`] is the production
//! implementation.

#![allow(clippy::missing_docs_in_private_items)]

mod config;
mod credentials;
pub mod extract;
mod identity;
mod image;
mod pull;
pub mod reference;
pub mod registry;
mod subid;

use std::path::PathBuf;

pub use config::{DEFAULT_RETRIES, ExtractionSpec, PullSpec};
pub use credentials::DockerCredentials;
pub use extract::{IdOffset, extract_layer};
pub use identity::Identity;
pub use image::{CONFIG_FILE, PulledImage, ROOTFS_DIR};
pub use pull::{MAX_BACKOFF, Puller, backoff_delay};
pub use reference::{Identifier, Reference};
pub use registry::{
    FetchError, FetchErrorKind, ImageSource, LayerDescriptor, OciRegistry, Registry, Transport,
};
pub use subid::{MIN_SUBID_RANGE, SubidTables};

/// Result type for strata-oci operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from pulling and extracting images.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The pull configuration file could not be read or parsed.
    #[error("invalid pull config {path}: {reason}")]
    Config {
        /// Path of the configuration file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// The configured registry certificate could not be loaded.
    #[error("registry certificate {path}: {reason}")]
    Certificate {
        /// Path of the certificate file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The pull failed; `source` is the last classified registry error.
    #[error("pull failed after {attempts} attempt(s)")]
    Pull {
        /// Number of attempts made.
        attempts: u32,
        /// Last error observed.
        #[source]
        source: FetchError,
    },

    /// The image predates schema 2 manifests and has no usable config.
    #[error("image {0} uses a legacy format and is too old to support")]
    LegacyImage(String),

    /// A registry request made after a successful pull failed.
    #[error(transparent)]
    Registry(#[from] FetchError),

    /// No usable destination directory.
    #[error("invalid destination: {0}")]
    Destination(String),

    /// The target user could not be resolved.
    #[error("user lookup failed: {0}")]
    User(String),

    /// No usable subordinate id range for the target user.
    #[error("subid resolution failed ({path}): {reason}")]
    Subid {
        /// Mapping table consulted.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Downloaded content did not match its expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },

    /// A filesystem mutation during extraction failed.
    #[error("extracting {path}: {source}")]
    Extract {
        /// Destination path being written or removed.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Filesystem I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Attaches a destination path to I/O failures during extraction.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Extract {
            path: path.into(),
            source,
        })
    }
}
