//! Registry collaborator boundary.
//!
//! The puller talks to registries only through [`Registry`] and the image
//! handles it returns ([`ImageSource`]). Every failure crossing this boundary
//! is classified once into a [`FetchErrorKind`]; callers never inspect error
//! text.
//!
//! [`OciRegistry`] implements the boundary on top of `oci-client`.

use std::fmt;
use std::time::Duration;

use oci_client::Client;
use oci_client::client::{Certificate, CertificateEncoding, ClientConfig, ClientProtocol};
use oci_client::errors::{OciDistributionError, OciErrorCode};
use oci_client::manifest::{OciDescriptor, OciImageManifest};
use tokio::io::AsyncWrite;

use crate::Reference;
use crate::credentials::DockerCredentials;

/// Upper bound on a single manifest or config request.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Error text fragments produced when a TLS client reaches a plain HTTP server.
const PLAIN_HTTP_HINTS: &[&str] = &[
    "InvalidContentType",
    "HTTP response to HTTPS client",
    "http response to https",
    "wrong version number",
];

/// How to reach the registry for one attempt.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Transport {
    /// Talk plain HTTP instead of HTTPS.
    pub plain_http: bool,
    /// Extra PEM-encoded root certificate to trust.
    pub root_cert: Option<Vec<u8>>,
}

impl Transport {
    /// HTTPS with the default trust roots.
    pub const fn https() -> Self {
        Self {
            plain_http: false,
            root_cert: None,
        }
    }

    /// Adds a trusted PEM certificate.
    #[must_use]
    pub fn with_root_cert(mut self, pem: Vec<u8>) -> Self {
        self.root_cert = Some(pem);
        self
    }

    /// Switches to plain HTTP.
    #[must_use]
    pub const fn plaintext(mut self) -> Self {
        self.plain_http = true;
        self
    }
}

/// Classification of a registry failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchErrorKind {
    /// An HTTPS request was answered in plain HTTP.
    PlainHttp,
    /// The image uses a manifest schema or media type predating OCI/schema 2.
    LegacyFormat,
    /// Authentication or authorization was refused.
    Unauthorized,
    /// A request timed out.
    Timeout,
    /// The custom trust root was rejected.
    Certificate,
    /// Anything else; worth retrying.
    Transient,
}

impl FetchErrorKind {
    /// Whether retrying the pull cannot help.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::LegacyFormat | Self::Unauthorized | Self::Timeout | Self::Certificate
        )
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PlainHttp => "server speaks plain HTTP",
            Self::LegacyFormat => "unsupported legacy image format",
            Self::Unauthorized => "unauthorized",
            Self::Timeout => "timed out",
            Self::Certificate => "certificate rejected",
            Self::Transient => "registry error",
        })
    }
}

/// A classified registry failure.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    kind: FetchErrorKind,
    message: String,
}

impl FetchError {
    /// Creates an error of the given kind.
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The classification.
    pub const fn kind(&self) -> FetchErrorKind {
        self.kind
    }
}

/// A layer blob as listed by the image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LayerDescriptor {
    /// Content digest (e.g. `sha256:…`).
    pub digest: String,
    /// Blob size in bytes as recorded in the manifest.
    pub size: u64,
    /// Media type of the blob.
    pub media_type: String,
}

impl LayerDescriptor {
    /// Creates a descriptor.
    pub fn new(digest: impl Into<String>, size: u64, media_type: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            size,
            media_type: media_type.into(),
        }
    }
}

impl From<&OciDescriptor> for LayerDescriptor {
    fn from(d: &OciDescriptor) -> Self {
        Self::new(
            d.digest.clone(),
            u64::try_from(d.size).unwrap_or_default(),
            d.media_type.clone(),
        )
    }
}

/// Something that can hand out images.
#[allow(async_fn_in_trait)]
pub trait Registry {
    /// Handle type for a fetched image.
    type Image: ImageSource;

    /// Fetches the manifest of `reference` over `transport`.
    async fn fetch(
        &self,
        reference: &Reference,
        transport: &Transport,
    ) -> Result<Self::Image, FetchError>;
}

/// A fetched image: its manifest digest, ordered layers, and config blob.
#[allow(async_fn_in_trait)]
pub trait ImageSource {
    /// Manifest content digest.
    fn digest(&self) -> &str;

    /// Layers bottom-to-top, in manifest order.
    fn layers(&self) -> &[LayerDescriptor];

    /// Raw image configuration JSON.
    async fn config(&self) -> Result<Vec<u8>, FetchError>;

    /// Streams one layer blob (possibly compressed) into `out`.
    ///
    /// May be called more than once for the same layer.
    async fn fetch_layer<W>(&self, layer: &LayerDescriptor, out: &mut W) -> Result<(), FetchError>
    where
        W: AsyncWrite + Unpin + Send;
}

/// Registry access through `oci-client`.
#[derive(Debug)]
pub struct OciRegistry {
    credentials: DockerCredentials,
    timeout: Duration,
}

impl Default for OciRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OciRegistry {
    /// Uses credentials from the Docker client configuration, if any.
    pub fn new() -> Self {
        Self {
            credentials: DockerCredentials::load_default(),
            timeout: FETCH_TIMEOUT,
        }
    }

    /// Replaces the credential source.
    #[must_use]
    pub fn with_credentials(mut self, credentials: DockerCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client(transport: &Transport) -> Result<Client, FetchError> {
        let protocol = if transport.plain_http {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let extra_root_certificates = transport
            .root_cert
            .iter()
            .map(|pem| Certificate {
                encoding: CertificateEncoding::Pem,
                data: pem.clone(),
            })
            .collect();
        let config = ClientConfig {
            protocol,
            extra_root_certificates,
            ..ClientConfig::default()
        };
        Client::try_from(config).map_err(|e| {
            let kind = if transport.root_cert.is_some() {
                FetchErrorKind::Certificate
            } else {
                FetchErrorKind::Transient
            };
            FetchError::new(kind, format!("building registry client: {e}"))
        })
    }
}

impl Registry for OciRegistry {
    type Image = RemoteImage;

    #[tracing::instrument(skip_all, fields(image = %reference, plain_http = transport.plain_http))]
    async fn fetch(
        &self,
        reference: &Reference,
        transport: &Transport,
    ) -> Result<RemoteImage, FetchError> {
        let client = Self::client(transport)?;
        let oci_ref = reference.to_oci();
        let auth = self.credentials.auth_for(&reference.registry);

        tracing::debug!("fetching manifest");
        let (manifest, digest) =
            tokio::time::timeout(self.timeout, client.pull_image_manifest(&oci_ref, &auth))
                .await
                .map_err(|_| timed_out(self.timeout, "manifest"))?
                .map_err(classify)?;

        let layers = manifest.layers.iter().map(LayerDescriptor::from).collect();
        Ok(RemoteImage {
            client,
            reference: oci_ref,
            manifest,
            digest,
            layers,
            timeout: self.timeout,
        })
    }
}

/// An image manifest fetched from a live registry.
pub struct RemoteImage {
    client: Client,
    reference: oci_client::Reference,
    manifest: OciImageManifest,
    digest: String,
    layers: Vec<LayerDescriptor>,
    timeout: Duration,
}

impl fmt::Debug for RemoteImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteImage")
            .field("reference", &self.reference.whole())
            .field("digest", &self.digest)
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

impl ImageSource for RemoteImage {
    fn digest(&self) -> &str {
        &self.digest
    }

    fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    async fn config(&self) -> Result<Vec<u8>, FetchError> {
        let mut out = Vec::new();
        tokio::time::timeout(
            self.timeout,
            self.client
                .pull_blob(&self.reference, &self.manifest.config, &mut out),
        )
        .await
        .map_err(|_| timed_out(self.timeout, "config"))?
        .map_err(classify)?;
        Ok(out)
    }

    async fn fetch_layer<W>(&self, layer: &LayerDescriptor, out: &mut W) -> Result<(), FetchError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let descriptor = self
            .manifest
            .layers
            .iter()
            .find(|d| d.digest == layer.digest)
            .ok_or_else(|| {
                FetchError::new(
                    FetchErrorKind::Transient,
                    format!("layer {} is not part of this image", layer.digest),
                )
            })?;
        self.client
            .pull_blob(&self.reference, descriptor, out)
            .await
            .map_err(classify)
    }
}

fn timed_out(after: Duration, what: &str) -> FetchError {
    FetchError::new(
        FetchErrorKind::Timeout,
        format!("{what} request exceeded {}s", after.as_secs()),
    )
}

/// Maps an `oci-client` error onto the closed set of fetch error kinds.
fn classify(err: OciDistributionError) -> FetchError {
    let kind = match &err {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => FetchErrorKind::Unauthorized,
        OciDistributionError::RegistryError { envelope, .. }
            if envelope
                .errors
                .iter()
                .any(|e| matches!(e.code, OciErrorCode::Unauthorized | OciErrorCode::Denied)) =>
        {
            FetchErrorKind::Unauthorized
        }
        OciDistributionError::UnsupportedSchemaVersionError(_)
        | OciDistributionError::UnsupportedMediaTypeError(_) => FetchErrorKind::LegacyFormat,
        OciDistributionError::RequestError(e) if e.is_timeout() => FetchErrorKind::Timeout,
        _ if plain_http_reply(&err) => FetchErrorKind::PlainHttp,
        _ => FetchErrorKind::Transient,
    };
    FetchError::new(kind, err.to_string())
}

/// Walks the source chain looking for a TLS handshake answered in cleartext.
fn plain_http_reply(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        let text = e.to_string();
        if PLAIN_HTTP_HINTS.iter().any(|hint| text.contains(hint)) {
            return true;
        }
        current = e.source();
    }
    false
}
