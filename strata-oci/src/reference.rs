//! OCI image reference parsing.
//!
//! Handles Docker-style image references:
//! - `alpine` → `docker.io/library/alpine:latest`
//! - `alpine:3.20` → `docker.io/library/alpine:3.20`
//! - `registry.local:5000/team/app@sha256:…` → digest-pinned reference

use std::fmt;

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const OFFICIAL_REPO_PREFIX: &str = "library";

/// A parsed OCI image reference. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Reference {
    /// Registry host, with port if any (e.g., `docker.io`, `localhost:5000`).
    pub registry: String,
    /// Repository path (e.g., `library/alpine`, `org/app`).
    pub repository: String,
    /// Image identifier (tag or digest).
    pub identifier: Identifier,
}

/// Tag or digest identifier for an image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Identifier {
    /// Named tag (e.g., `latest`, `v1.0`).
    Tag(String),
    /// Content-addressable digest (e.g., `sha256:abc123...`).
    Digest(String),
}

impl Reference {
    /// Parses an image reference string.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(crate::Error::InvalidReference("empty reference".into()));
        }

        // Split off @digest
        let (name, raw_id) = if let Some((n, digest)) = trimmed.split_once('@') {
            if !digest.contains(':') {
                return Err(crate::Error::InvalidReference(format!(
                    "invalid digest: {digest}"
                )));
            }
            (n, Identifier::Digest(digest.to_owned()))
        } else {
            (trimmed, Identifier::Tag(DEFAULT_TAG.to_owned()))
        };

        // Split registry from repository
        let (registry, repo_with_tag) = match name.split_once('/') {
            Some((first, rest)) if is_registry(first) => (first.to_owned(), rest.to_owned()),
            _ => {
                let repo = if name.contains('/') {
                    name.to_owned()
                } else {
                    format!("{OFFICIAL_REPO_PREFIX}/{name}")
                };
                (DEFAULT_REGISTRY.to_owned(), repo)
            }
        };

        // A digest wins over any tag written alongside it.
        let (repository, identifier) = match raw_id {
            Identifier::Digest(_) => match repo_with_tag.rsplit_once(':') {
                Some((repo, _)) => (repo.to_owned(), raw_id),
                None => (repo_with_tag, raw_id),
            },
            Identifier::Tag(_) => match repo_with_tag.rsplit_once(':') {
                Some((repo, tag)) => (repo.to_owned(), Identifier::Tag(tag.to_owned())),
                None => (repo_with_tag, Identifier::Tag(DEFAULT_TAG.to_owned())),
            },
        };

        if repository.is_empty() || repository.ends_with('/') {
            return Err(crate::Error::InvalidReference(format!(
                "missing repository in {trimmed}"
            )));
        }
        if repository.chars().any(char::is_uppercase) {
            return Err(crate::Error::InvalidReference(format!(
                "repository must be lowercase: {repository}"
            )));
        }

        Ok(Self {
            registry,
            repository,
            identifier,
        })
    }

    /// Returns the tag or digest string for API requests.
    pub fn reference_str(&self) -> &str {
        match &self.identifier {
            Identifier::Tag(t) | Identifier::Digest(t) => t,
        }
    }

    /// Converts into the reference type used by the registry client.
    pub(crate) fn to_oci(&self) -> oci_client::Reference {
        match &self.identifier {
            Identifier::Tag(t) => oci_client::Reference::with_tag(
                self.registry.clone(),
                self.repository.clone(),
                t.clone(),
            ),
            Identifier::Digest(d) => oci_client::Reference::with_digest(
                self.registry.clone(),
                self.repository.clone(),
                d.clone(),
            ),
        }
    }
}

/// Returns `true` if the string looks like a registry hostname.
fn is_registry(s: &str) -> bool {
    s.contains('.') || s.contains(':') || s == "localhost"
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.identifier {
            Identifier::Tag(t) => write!(f, ":{t}"),
            Identifier::Digest(d) => write!(f, "@{d}"),
        }
    }
}
