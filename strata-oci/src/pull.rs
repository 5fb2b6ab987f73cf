//! Pulling with retries, exponential backoff, and HTTPS→HTTP fallback.

use std::path::Path;
use std::time::Duration;

use crate::registry::{FetchError, FetchErrorKind, OciRegistry, Registry, Transport};
use crate::{Error, PullSpec, PulledImage, Reference, Result};

/// Ceiling for the delay between two attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

const PEM_CERT_MARKER: &[u8] = b"-----BEGIN CERTIFICATE-----";

/// Delay after failed attempt number `attempt` (0-based): `min(2^attempt s, cap)`.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

/// Fetches image handles from a [`Registry`], retrying transient failures.
#[derive(Debug)]
pub struct Puller<R> {
    registry: R,
    max_backoff: Duration,
}

impl Default for Puller<OciRegistry> {
    fn default() -> Self {
        Self::new(OciRegistry::new())
    }
}

impl<R: Registry> Puller<R> {
    /// Creates a puller over `registry`.
    pub const fn new(registry: R) -> Self {
        Self {
            registry,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// Overrides the backoff ceiling.
    #[must_use]
    pub const fn with_max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = cap;
        self
    }

    /// The wrapped registry.
    pub const fn registry(&self) -> &R {
        &self.registry
    }

    /// Pulls the image named by `spec`, making up to `spec.retries()` attempts.
    ///
    /// Unauthorized, legacy-format, timeout, and certificate failures end the
    /// pull at once. A plain-HTTP answer to an HTTPS request switches the rest
    /// of this call to plain HTTP. Other failures are retried after
    /// [`backoff_delay`]; the calling task sleeps in between.
    #[tracing::instrument(skip_all, fields(image = %spec.image))]
    pub async fn pull(&self, spec: &PullSpec) -> Result<PulledImage<R::Image>> {
        let reference = Reference::parse(&spec.image)?;
        let mut transport = Transport::https();
        if let Some(cert) = &spec.cert {
            transport = transport.with_root_cert(load_cert(cert)?);
        }

        let attempts = spec.retries();
        let mut last = FetchError::new(FetchErrorKind::Transient, "no attempt made");
        for attempt in 0..attempts {
            let err = match self.registry.fetch(&reference, &transport).await {
                Ok(image) => {
                    tracing::debug!(attempt, "manifest fetched");
                    return Ok(PulledImage::new(
                        reference,
                        image,
                        spec.extraction.clone(),
                    ));
                }
                Err(err) => err,
            };

            match err.kind() {
                FetchErrorKind::Timeout => {
                    tracing::warn!("connection to registry timed out: {err}");
                    return Err(Error::Pull {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                kind if kind.is_terminal() => {
                    return Err(Error::Pull {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                FetchErrorKind::PlainHttp if !transport.plain_http => {
                    tracing::info!("registry answered in plain HTTP, retrying without TLS");
                    transport = transport.plaintext();
                }
                _ => tracing::warn!(attempt, "pull failed, trying again: {err}"),
            }
            last = err;

            if attempt + 1 < attempts {
                tokio::time::sleep(backoff_delay(attempt, self.max_backoff)).await;
            }
        }

        Err(Error::Pull {
            attempts,
            source: last,
        })
    }
}

/// Reads a PEM certificate bundle to trust for this pull.
fn load_cert(path: &Path) -> Result<Vec<u8>> {
    let pem = std::fs::read(path).map_err(|e| Error::Certificate {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !pem
        .windows(PEM_CERT_MARKER.len())
        .any(|w| w == PEM_CERT_MARKER)
    {
        return Err(Error::Certificate {
            path: path.to_path_buf(),
            reason: "no PEM certificate found".into(),
        });
    }
    Ok(pem)
}
