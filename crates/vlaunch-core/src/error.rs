//! Error types for provisioning and supervising the proxy core.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the provisioner and the supervisor.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Proxy URL uses a scheme other than http, socks4 or socks5.
    #[error("Unknown protocol: {0}")]
    UnsupportedProxyScheme(String),

    /// Proxy URL could not be parsed or has no host.
    #[error("Invalid proxy URL '{0}'")]
    InvalidProxyUrl(String),

    /// The archive request failed or returned a bad status.
    #[error("Download failed: {0}")]
    NetworkFetchError(String),

    /// The downloaded bytes are not a readable zip archive.
    #[error("Failed to extract archive: {0}")]
    ArchiveExtractionError(String),

    /// The external binary could not be started.
    #[error("Failed to launch {}: {source}", path.display())]
    ProcessSpawnError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external process exited with a code outside the accepted set.
    #[error("Process exited with code {0}")]
    ProcessAbnormalExit(i32),

    /// Launcher settings are unusable as given.
    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<zip::result::ZipError> for LaunchError {
    fn from(e: zip::result::ZipError) -> Self {
        LaunchError::ArchiveExtractionError(e.to_string())
    }
}

impl From<ureq::Error> for LaunchError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Status(code, resp) => {
                LaunchError::NetworkFetchError(format!("HTTP {} from {}", code, resp.get_url()))
            }
            ureq::Error::Transport(t) => LaunchError::NetworkFetchError(t.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LaunchError>;
