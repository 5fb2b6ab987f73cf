//! Shared fixtures: in-memory layer tarballs and a scripted registry.

#![allow(dead_code, missing_docs, clippy::missing_docs_in_private_items)]

use std::collections::{HashMap, VecDeque};
use std::io::Write as _;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use strata_oci::{
    FetchError, FetchErrorKind, ImageSource, LayerDescriptor, Reference, Registry, Transport,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// Builds a layer tarball entry by entry. Every entry is owned by 0:0
/// unless stated otherwise.
pub struct Layer {
    builder: tar::Builder<Vec<u8>>,
}

impl Default for Layer {
    fn default() -> Self {
        Self::new()
    }
}

impl Layer {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.file_owned(path, data, 0o644, 0, 0)
    }

    pub fn file_owned(mut self, path: &str, data: &[u8], mode: u32, uid: u64, gid: u64) -> Self {
        let mut header = header(tar::EntryType::Regular, mode, uid, gid);
        header.set_size(data.len() as u64);
        self.builder.append_data(&mut header, path, data).unwrap();
        self
    }

    pub fn dir(self, path: &str, mode: u32) -> Self {
        self.dir_owned(path, mode, 0, 0)
    }

    pub fn dir_owned(mut self, path: &str, mode: u32, uid: u64, gid: u64) -> Self {
        let mut header = header(tar::EntryType::Directory, mode, uid, gid);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.link(tar::EntryType::Symlink, path, target)
    }

    pub fn hardlink(self, path: &str, target: &str) -> Self {
        self.link(tar::EntryType::Link, path, target)
    }

    /// Link names are stored verbatim.
    fn link(mut self, kind: tar::EntryType, path: &str, target: &str) -> Self {
        let mut header = header(kind, 0o777, 0, 0);
        header.set_path(path).unwrap();
        let slot = &mut header.as_old_mut().linkname;
        slot[..target.len()].copy_from_slice(target.as_bytes());
        header.set_cksum();
        self.builder.append(&header, std::io::empty()).unwrap();
        self
    }

    /// Marks `path` from a lower layer as deleted.
    pub fn whiteout(self, path: &str) -> Self {
        let marker = match path.rsplit_once('/') {
            Some((dir, name)) => format!("{dir}/.wh.{name}"),
            None => format!(".wh.{path}"),
        };
        self.file(&marker, b"")
    }

    /// Hides everything `dir` inherited from lower layers.
    pub fn opaque(self, dir: &str) -> Self {
        self.file(&format!("{dir}/.wh..wh..opq"), b"")
    }

    /// Appends a regular file whose stored name is written verbatim, so it
    /// may contain `..` or a leading `/`.
    pub fn raw_file(mut self, name: &str, data: &[u8]) -> Self {
        let mut header = header(tar::EntryType::Regular, 0o644, 0, 0);
        let slot = &mut header.as_old_mut().name;
        slot[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(data.len() as u64);
        header.set_cksum();
        self.builder.append(&header, data).unwrap();
        self
    }

    pub fn tar(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }

    pub fn gzip(self) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&self.tar()).unwrap();
        encoder.finish().unwrap()
    }

    pub fn zstd(self) -> Vec<u8> {
        zstd::encode_all(self.tar().as_slice(), 0).unwrap()
    }
}

fn header(kind: tar::EntryType, mode: u32, uid: u64, gid: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_uid(uid);
    header.set_gid(gid);
    header.set_mtime(0);
    header.set_size(0);
    header
}

pub fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data).as_slice()))
}

/// An image held entirely in memory.
#[derive(Debug, Clone)]
pub struct FakeImage {
    pub digest: String,
    pub layers: Vec<LayerDescriptor>,
    pub blobs: HashMap<String, Vec<u8>>,
    /// `None` behaves like a legacy image without a usable config.
    pub config: Option<Vec<u8>>,
}

impl FakeImage {
    pub fn new(config: &str) -> Self {
        Self {
            digest: sha256(config.as_bytes()),
            layers: Vec::new(),
            blobs: HashMap::new(),
            config: Some(config.as_bytes().to_vec()),
        }
    }

    pub fn legacy() -> Self {
        Self {
            config: None,
            ..Self::new("{}")
        }
    }

    pub fn with_layer(mut self, blob: Vec<u8>) -> Self {
        let digest = sha256(&blob);
        self.layers.push(LayerDescriptor::new(
            digest.clone(),
            blob.len() as u64,
            LAYER_MEDIA_TYPE,
        ));
        self.blobs.insert(digest, blob);
        self
    }

    /// Adds a layer whose manifest digest does not match its content.
    pub fn with_corrupt_layer(mut self, blob: Vec<u8>) -> Self {
        let digest = sha256(b"something else");
        self.layers.push(LayerDescriptor::new(
            digest.clone(),
            blob.len() as u64,
            LAYER_MEDIA_TYPE,
        ));
        self.blobs.insert(digest, blob);
        self
    }
}

impl ImageSource for FakeImage {
    fn digest(&self) -> &str {
        &self.digest
    }

    fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    async fn config(&self) -> Result<Vec<u8>, FetchError> {
        self.config
            .clone()
            .ok_or_else(|| FetchError::new(FetchErrorKind::LegacyFormat, "schema 1 manifest"))
    }

    async fn fetch_layer<W>(&self, layer: &LayerDescriptor, out: &mut W) -> Result<(), FetchError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let blob = self.blobs.get(&layer.digest).ok_or_else(|| {
            FetchError::new(FetchErrorKind::Transient, format!("no blob {}", layer.digest))
        })?;
        out.write_all(blob)
            .await
            .map_err(|e| FetchError::new(FetchErrorKind::Transient, e.to_string()))
    }
}

/// Replays a fixed sequence of fetch outcomes and records every call.
#[derive(Debug, Default)]
pub struct ScriptedRegistry {
    outcomes: Mutex<VecDeque<Result<FakeImage, FetchErrorKind>>>,
    calls: Mutex<Vec<Transport>>,
}

impl ScriptedRegistry {
    pub fn new(outcomes: impl IntoIterator<Item = Result<FakeImage, FetchErrorKind>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Transports seen so far, one per attempt.
    pub fn calls(&self) -> Vec<Transport> {
        self.calls.lock().unwrap().clone()
    }
}

impl Registry for ScriptedRegistry {
    type Image = FakeImage;

    async fn fetch(
        &self,
        _reference: &Reference,
        transport: &Transport,
    ) -> Result<FakeImage, FetchError> {
        self.calls.lock().unwrap().push(transport.clone());
        let next = self.outcomes.lock().unwrap().pop_front();
        match next {
            Some(Ok(image)) => Ok(image),
            Some(Err(kind)) => Err(FetchError::new(kind, "scripted failure")),
            None => Err(FetchError::new(FetchErrorKind::Transient, "script exhausted")),
        }
    }
}
