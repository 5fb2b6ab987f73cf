//! Registry credentials from the Docker client configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use oci_client::secrets::RegistryAuth;
use serde::Deserialize;

/// Hosts that all name Docker Hub in `config.json`.
const DOCKER_HUB_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "https://index.docker.io/v1/",
];

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Credentials parsed from a Docker `config.json`.
///
/// Missing or unreadable files yield an empty set, which means anonymous
/// access.
#[derive(Debug, Default)]
pub struct DockerCredentials {
    auths: HashMap<String, (String, String)>,
}

impl DockerCredentials {
    /// Loads `$DOCKER_CONFIG/config.json`, falling back to `~/.docker/config.json`.
    pub fn load_default() -> Self {
        default_path().map_or_else(Self::default, |p| Self::load(&p))
    }

    /// Loads credentials from a specific file.
    pub fn load(path: &Path) -> Self {
        let Ok(data) = std::fs::read(path) else {
            return Self::default();
        };
        match serde_json::from_slice::<DockerConfig>(&data) {
            Ok(config) => Self::from_config(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable docker config: {e}");
                Self::default()
            }
        }
    }

    fn from_config(config: DockerConfig) -> Self {
        let auths = config
            .auths
            .into_iter()
            .filter_map(|(host, entry)| Some((normalize_host(&host), decode(entry)?)))
            .collect();
        Self { auths }
    }

    /// Returns the auth to present to `registry`.
    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        match self.auths.get(&normalize_host(registry)) {
            Some((user, password)) => RegistryAuth::Basic(user.clone(), password.clone()),
            None => RegistryAuth::Anonymous,
        }
    }
}

fn decode(entry: AuthEntry) -> Option<(String, String)> {
    if let (Some(user), Some(password)) = (entry.username, entry.password) {
        return Some((user, password));
    }
    let raw = BASE64.decode(entry.auth?).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_owned(), password.to_owned()))
}

/// Strips scheme and path so `https://host/v1/` and `host` compare equal.
fn normalize_host(host: &str) -> String {
    if DOCKER_HUB_ALIASES.contains(&host) {
        return "docker.io".to_owned();
    }
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    if DOCKER_HUB_ALIASES.contains(&host) {
        "docker.io".to_owned()
    } else {
        host.to_owned()
    }
}

fn default_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    dirs::home_dir().map(|home| home.join(".docker").join("config.json"))
}
