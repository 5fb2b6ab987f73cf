//! A pulled image and its materialization into a destination directory.

use std::fs::{self, DirBuilder, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::{DirBuilderExt, chown};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::extract::{IdOffset, extract_layer};
use crate::registry::{FetchErrorKind, ImageSource, LayerDescriptor};
use crate::{Error, ExtractionSpec, Identity, IoResultExt, Reference, Result, SubidTables};

/// Image configuration file written into the destination.
pub const CONFIG_FILE: &str = "config.json";
/// Directory under the destination that receives the filesystem tree.
pub const ROOTFS_DIR: &str = "rootfs";

const DEST_MODE: u32 = 0o755;

/// An image handle returned by a successful pull, ready to be extracted.
#[derive(Debug)]
pub struct PulledImage<S> {
    reference: Reference,
    source: S,
    spec: ExtractionSpec,
    subids: SubidTables,
}

impl<S: ImageSource> PulledImage<S> {
    /// Wraps a fetched image with the settings used to extract it.
    pub fn new(reference: Reference, source: S, spec: ExtractionSpec) -> Self {
        Self {
            reference,
            source,
            spec,
            subids: SubidTables::default(),
        }
    }

    /// Reads subordinate ids from other tables than `/etc/sub{u,g}id`.
    #[must_use]
    pub fn with_subid_tables(mut self, subids: SubidTables) -> Self {
        self.subids = subids;
        self
    }

    /// The reference this image was pulled by.
    pub const fn reference(&self) -> &Reference {
        &self.reference
    }

    /// The extraction settings, including offsets resolved by [`Self::extract`].
    pub const fn spec(&self) -> &ExtractionSpec {
        &self.spec
    }

    /// The underlying image handle.
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Returns `<registry>/<repository>@<manifest digest>`.
    ///
    /// The configuration blob is fetched first: legacy images report a
    /// digest that changes on every request, and they are recognizable by
    /// their config being unavailable.
    pub async fn digest(&self) -> Result<String> {
        self.config().await?;
        Ok(format!(
            "{}/{}@{}",
            self.reference.registry,
            self.reference.repository,
            self.source.digest()
        ))
    }

    /// Materializes the image under the destination directory.
    ///
    /// Writes `config.json`, then applies every layer bottom-to-top into
    /// `rootfs/`. Returns the rootfs path. A failure leaves whatever was
    /// already written in place.
    #[tracing::instrument(skip(self), fields(image = %self.reference))]
    pub async fn extract(&mut self) -> Result<PathBuf> {
        let dest = self.prepare_dest()?;
        self.write_config(&dest).await?;

        let rootfs = dest.join(ROOTFS_DIR);
        DirBuilder::new()
            .recursive(true)
            .mode(DEST_MODE)
            .create(&rootfs)
            .at(&rootfs)?;

        let offset = self.resolve_offset()?;

        let total = self.source.layers().len();
        for (i, layer) in self.source.layers().iter().enumerate() {
            tracing::debug!(
                digest = %layer.digest,
                size = layer.size,
                "downloading layer {}/{total}",
                i + 1
            );
            let blob = self.download(layer).await?;
            let expected = layer.digest.clone();
            let target = rootfs.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut blob = blob;
                verify_digest(&mut blob, &expected)?;
                extract_layer(&mut blob, &target, offset)
            })
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))??;
        }

        chown(&rootfs, Some(offset.uid), Some(offset.gid)).at(&rootfs)?;
        tracing::info!(rootfs = %rootfs.display(), layers = total, "image extracted");
        Ok(rootfs)
    }

    async fn config(&self) -> Result<Vec<u8>> {
        self.source.config().await.map_err(|e| match e.kind() {
            FetchErrorKind::LegacyFormat => Error::LegacyImage(self.reference.to_string()),
            _ => Error::Registry(e),
        })
    }

    /// Checks the destination is configured, creating it if needed.
    fn prepare_dest(&self) -> Result<PathBuf> {
        let dest = &self.spec.dest;
        if dest.as_os_str().is_empty() {
            return Err(Error::Destination("no destination configured".into()));
        }
        match fs::metadata(dest) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::Destination(format!(
                    "{} is not a directory",
                    dest.display()
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                DirBuilder::new()
                    .mode(DEST_MODE)
                    .create(dest)
                    .map_err(|e| Error::Destination(format!("{}: {e}", dest.display())))?;
            }
            Err(e) => return Err(Error::Destination(format!("{}: {e}", dest.display()))),
        }
        Ok(dest.clone())
    }

    /// Writes the image configuration pretty-printed, keeping the registry's key order.
    async fn write_config(&self, dest: &Path) -> Result<()> {
        let raw = self.config().await?;
        let config: serde_json::Value = serde_json::from_slice(&raw)?;
        let path = dest.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(&config)?).at(&path)
    }

    /// Resolves the target user and the ownership offset for every layer.
    fn resolve_offset(&mut self) -> Result<IdOffset> {
        let user = Identity::resolve(&self.spec.user)?;
        let (uid, gid) = if self.spec.use_subuid {
            self.subids.resolve(&user)?
        } else {
            (user.uid, user.gid)
        };
        tracing::debug!(user = %user.name, uid, gid, subuid = self.spec.use_subuid, "resolved owner");
        self.spec.base = Some((uid, gid));
        Ok(IdOffset::new(uid, gid))
    }

    /// Downloads a layer into an anonymous temporary file.
    ///
    /// The file has no name on disk and vanishes when dropped.
    async fn download(&self, layer: &LayerDescriptor) -> Result<File> {
        let file = tempfile::tempfile()?;
        let mut out = tokio::fs::File::from_std(file.try_clone()?);
        self.source.fetch_layer(layer, &mut out).await?;
        out.flush().await?;
        Ok(file)
    }
}

/// Verifies a `sha256:` digest; other algorithms are not checked.
fn verify_digest(blob: &mut (impl Read + Seek), expected: &str) -> Result<()> {
    let Some(want) = expected.strip_prefix("sha256:") else {
        return Ok(());
    };
    blob.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    io::copy(blob, &mut hasher)?;
    let actual = hex::encode(hasher.finalize().as_slice());
    if actual == want {
        Ok(())
    } else {
        Err(Error::DigestMismatch {
            expected: expected.to_owned(),
            actual: format!("sha256:{actual}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn digest_verification() {
        // sha256("hello")
        let ok = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        verify_digest(&mut Cursor::new(b"hello"), ok).unwrap();
        verify_digest(&mut Cursor::new(b"hello"), "sha512:whatever").unwrap();
        let err = verify_digest(&mut Cursor::new(b"hellO"), ok).unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }
}
