//! Binary provisioner: makes sure the proxy core executable exists locally.

pub mod archive;
pub mod fetch;

use crate::error::Result;
use crate::proxy::ForwardProxy;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryStatus {
    Unknown,
    NotExist { proxy_url: Option<String> },
    Downloading,
    DownloadError { message: String, proxy_url: Option<String> },
    Complete,
}

impl BinaryStatus {
    /// True when the binary is absent and a download may be started.
    pub fn is_missing(&self) -> bool {
        matches!(self, BinaryStatus::NotExist { .. } | BinaryStatus::DownloadError { .. })
    }

    pub fn proxy_url(&self) -> Option<&str> {
        match self {
            BinaryStatus::NotExist { proxy_url } | BinaryStatus::DownloadError { proxy_url, .. } => {
                proxy_url.as_deref()
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Where the binary comes from and where it goes.
#[derive(Debug, Clone)]
pub struct ProvisionTarget {
    pub archive_url: String,
    /// File name of the archive entry to extract.
    pub entry_name: String,
    pub binary_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

pub struct Provisioner {
    target: Arc<ProvisionTarget>,
    status: Arc<watch::Sender<BinaryStatus>>,
    runtime: Handle,
}

impl Provisioner {
    pub fn new(target: ProvisionTarget, runtime: Handle) -> Self {
        let (tx, _rx) = watch::channel(BinaryStatus::Unknown);
        Provisioner {
            target: Arc::new(target),
            status: Arc::new(tx),
            runtime,
        }
    }

    pub fn status(&self) -> BinaryStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BinaryStatus> {
        self.status.subscribe()
    }

    /// Resolve `Unknown` by looking for the binary on disk.
    pub fn probe(&self) -> BinaryStatus {
        let exists = self.target.binary_path.exists();
        self.status.send_if_modified(|s| {
            if *s != BinaryStatus::Unknown {
                return false;
            }
            *s = if exists {
                BinaryStatus::Complete
            } else {
                BinaryStatus::NotExist { proxy_url: None }
            };
            true
        });
        self.status()
    }

    /// Record the proxy URL the next download should use.
    ///
    /// Only applies while the binary is missing; a failed download returns to
    /// `NotExist` here, which is how the user retries.
    pub fn set_proxy_url(&self, url: &str) {
        let url = url.trim();
        self.status.send_if_modified(|s| {
            if !s.is_missing() {
                return false;
            }
            *s = BinaryStatus::NotExist {
                proxy_url: (!url.is_empty()).then(|| url.to_string()),
            };
            true
        });
    }

    /// Start downloading the binary in the background.
    ///
    /// Returns `None` unless the status is `NotExist`. Otherwise the status is
    /// `Downloading` by the time this returns, and the handle resolves to the
    /// outcome of the fetch. Failures are also recorded as `DownloadError`.
    pub fn begin_fetch(&self) -> Option<JoinHandle<Result<()>>> {
        let mut proxy_url = None;
        let started = self.status.send_if_modified(|s| match s {
            BinaryStatus::NotExist { proxy_url: p } => {
                proxy_url = p.take();
                *s = BinaryStatus::Downloading;
                true
            }
            _ => false,
        });
        if !started {
            return None;
        }

        info!(url = %self.target.archive_url, proxy = ?proxy_url, "Start downloading binary");
        let target = Arc::clone(&self.target);
        let status = Arc::clone(&self.status);
        Some(self.runtime.spawn_blocking(move || {
            match fetch_and_install(&target, proxy_url.as_deref()) {
                Ok(()) => {
                    info!(path = %target.binary_path.display(), "Binary installed");
                    status.send_replace(BinaryStatus::Complete);
                    Ok(())
                }
                Err(e) => {
                    warn!("Binary download failed: {}", e);
                    status.send_replace(BinaryStatus::DownloadError {
                        message: e.to_string(),
                        proxy_url,
                    });
                    Err(e)
                }
            }
        }))
    }
}

fn fetch_and_install(target: &ProvisionTarget, proxy_url: Option<&str>) -> Result<()> {
    let proxy = proxy_url.map(ForwardProxy::parse).transpose()?;

    let data = fetch::download(&target.archive_url, proxy.as_ref())?;
    info!(bytes = data.len(), "Archive downloaded");

    let part = partial_path(&target.binary_path);
    if let Some(parent) = target.binary_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let written = match archive::extract_entry(Cursor::new(data), &target.entry_name, &part) {
        Ok(n) => n,
        Err(e) => {
            let _ = std::fs::remove_file(&part);
            return Err(e);
        }
    };
    if written == 0 {
        warn!(entry = %target.entry_name, "Archive has no matching entry; installed an empty file");
    }

    make_executable(&part)?;
    std::fs::rename(&part, &target.binary_path)?;
    info!(bytes = written, "Binary extracted");
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
