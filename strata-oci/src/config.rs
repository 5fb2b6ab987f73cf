//! Pull configuration loaded from a JSON file.
//!
//! ```json
//! {
//!   "Name": "alpine:3.20",
//!   "Cert": "/etc/strata/registry.pem",
//!   "Retries": 5,
//!   "Spec": { "Dest": "/var/lib/images/alpine", "User": "builder", "UseSubuid": true }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Number of pull attempts when the config leaves `Retries` unset or non-positive.
pub const DEFAULT_RETRIES: u32 = 3;

/// What to pull and how to extract it.
#[derive(Debug, Clone, Default, Deserialize)]
#[non_exhaustive]
pub struct PullSpec {
    /// Image reference string.
    #[serde(rename = "Name", alias = "name")]
    pub image: String,
    /// PEM certificate to trust in addition to the system roots.
    #[serde(rename = "Cert", alias = "cert", default)]
    pub cert: Option<PathBuf>,
    /// Raw retry count as written in the config; see [`PullSpec::retries`].
    #[serde(rename = "Retries", alias = "retries", default)]
    pub raw_retries: Option<i64>,
    /// Extraction settings.
    #[serde(rename = "Spec", alias = "spec", default)]
    pub extraction: ExtractionSpec,
}

/// Where and as whom the rootfs is materialized.
#[derive(Debug, Clone, Default, Deserialize)]
#[non_exhaustive]
pub struct ExtractionSpec {
    /// Destination directory; receives `config.json` and `rootfs/`.
    #[serde(rename = "Dest", alias = "dest", default)]
    pub dest: PathBuf,
    /// Owner of the extracted tree. Empty means the calling user.
    #[serde(rename = "User", alias = "user", default)]
    pub user: String,
    /// Offset ownership by the user's subordinate id range instead of its own ids.
    #[serde(rename = "UseSubuid", alias = "use_subuid", default)]
    pub use_subuid: bool,
    #[serde(skip)]
    pub(crate) base: Option<(u32, u32)>,
}

impl PullSpec {
    /// Creates a spec for `image` with default retries and the given extraction settings.
    pub fn new(image: impl Into<String>, extraction: ExtractionSpec) -> Self {
        Self {
            image: image.into(),
            cert: None,
            raw_retries: None,
            extraction,
        }
    }

    /// Loads a spec from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&data).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Sets the trusted certificate path.
    #[must_use]
    pub fn with_cert(mut self, cert: impl Into<PathBuf>) -> Self {
        self.cert = Some(cert.into());
        self
    }

    /// Sets the attempt count.
    #[must_use]
    pub const fn with_retries(mut self, retries: i64) -> Self {
        self.raw_retries = Some(retries);
        self
    }

    /// Number of pull attempts, never less than one.
    pub fn retries(&self) -> u32 {
        match self.raw_retries {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => DEFAULT_RETRIES,
        }
    }
}

impl ExtractionSpec {
    /// Creates an extraction spec for `dest`, owned by the calling user.
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            ..Self::default()
        }
    }

    /// Sets the target user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Selects subordinate id remapping.
    #[must_use]
    pub const fn with_subuid(mut self, use_subuid: bool) -> Self {
        self.use_subuid = use_subuid;
        self
    }

    /// Ownership offsets resolved by the last extraction, if any.
    pub const fn base_ids(&self) -> Option<(u32, u32)> {
        self.base
    }
}
