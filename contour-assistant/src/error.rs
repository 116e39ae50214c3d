use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while fetching a model file.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// TLS handshake failed because the server certificate could not be verified
    #[error("SSL certificate verification failed: {0}")]
    Certificate(#[source] reqwest::Error),

    #[error("Download failed with status: {0}")]
    Http(reqwest::StatusCode),

    #[error("Network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Output name that would not land directly in the models directory
    #[error("Invalid model file name: {0:?}")]
    InvalidName(String),
}

impl DownloadError {
    /// Classify a transport failure, separating certificate problems from the rest.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if is_certificate_failure(&err) {
            Self::Certificate(err)
        } else {
            Self::Network(err)
        }
    }

    pub fn is_certificate(&self) -> bool {
        matches!(self, Self::Certificate(_))
    }

    /// User-facing guidance for errors the user can fix themselves.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::Certificate(_) => Some(format!(
                "SSL certificate verification failed.\n\n{}\n\nOriginal error: {}",
                certificate_hint(),
                self
            )),
            Self::Http(status) if status.as_u16() == 404 => Some(
                "The file was not found. Check the repository name, file name and revision."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

fn certificate_hint() -> &'static str {
    if cfg!(target_os = "macos") {
        "Make sure the system clock is correct and that no proxy is rewriting HTTPS traffic. \
         If a corporate proxy is in use, add its root certificate to the login keychain."
    } else if cfg!(target_os = "windows") {
        "Make sure the system clock is correct and run Windows Update to refresh root certificates. \
         If a corporate proxy is in use, import its root certificate."
    } else {
        "Make sure the system clock is correct and the ca-certificates package is installed. \
         If a corporate proxy is in use, add its root certificate to the system store."
    }
}

/// Walk the source chain looking for TLS verification markers.
fn is_certificate_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("ssl") || text.contains("unknownissuer") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Reasons a background load was not started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("No model path configured")]
    EmptyPath,

    #[error("Model file not found: {0}")]
    NotAFile(PathBuf),

    #[error("A model is already loading")]
    AlreadyLoading,

    #[error("Failed to start loader thread: {0}")]
    Spawn(String),
}

/// Why the assistant cannot take a chat request right now.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("No API key configured. Set an API key or a base URL in the assistant settings.")]
    MissingCredential,

    #[error("Set a local model path or a base URL in the assistant settings.")]
    MissingModel,

    #[error("Local model is still loading. Try again in a moment.")]
    StillLoading,

    #[error("Local model failed to load: {0}")]
    ModelLoadFailed(String),

    #[error("{0}")]
    Setup(String),
}

impl ReadinessError {
    /// True when the user has to change settings before retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential | Self::MissingModel | Self::Setup(_)
        )
    }
}

/// Errors from the remote chat backends.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Unknown model provider '{0}'")]
    UnknownProvider(String),

    #[error("No API key for {0}")]
    MissingCredential(&'static str),

    #[error("Invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Malformed stream event: {0}")]
    Stream(String),
}

/// Errors from the JSON-backed configuration store.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),
}
