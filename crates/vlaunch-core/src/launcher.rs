//! Ties provisioning, the config file and the supervisor together for a front end.

use crate::config::LauncherSettings;
use crate::config_file::ConfigFile;
use crate::error::{LaunchError, Result};
use crate::logger::EventLog;
use crate::provision::{BinaryStatus, ProvisionTarget, Provisioner};
use crate::supervisor::{ProcessStatus, Supervisor};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Launcher {
    settings: LauncherSettings,
    events: Arc<EventLog>,
    config: ConfigFile,
    provisioner: Provisioner,
    supervisor: Supervisor,
    runtime: Handle,
    /// Last process status seen by `reconcile`, for exit reporting.
    observed: ProcessStatus,
}

impl Launcher {
    pub fn new(settings: LauncherSettings, runtime: Handle) -> Result<Self> {
        if settings.binary_path.as_os_str().is_empty() {
            return Err(LaunchError::Settings("binary_path is empty".into()));
        }
        if settings.archive_entry.trim().is_empty() {
            return Err(LaunchError::Settings("archive_entry is empty".into()));
        }
        let events = EventLog::new(&settings.log_path).map_err(|e| {
            LaunchError::Settings(format!("cannot open log '{}': {}", settings.log_path, e))
        })?;

        let provisioner = Provisioner::new(
            ProvisionTarget {
                archive_url: settings.archive_url.clone(),
                entry_name: settings.archive_entry.clone(),
                binary_path: settings.binary_path.clone(),
            },
            runtime.clone(),
        );
        let supervisor = Supervisor::new(&settings.binary_path, settings.shutdown_grace());

        Ok(Launcher {
            config: ConfigFile::new(&settings.config_path),
            events: Arc::new(events),
            provisioner,
            supervisor,
            runtime,
            observed: ProcessStatus::default(),
            settings,
        })
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn binary_status(&self) -> BinaryStatus {
        self.provisioner.status()
    }

    pub fn process_status(&self) -> ProcessStatus {
        self.supervisor.status()
    }

    pub fn subscribe_binary(&self) -> watch::Receiver<BinaryStatus> {
        self.provisioner.subscribe()
    }

    pub fn subscribe_process(&self) -> watch::Receiver<ProcessStatus> {
        self.supervisor.subscribe()
    }

    // -----------------------------------------------------------------------
    // Binary
    // -----------------------------------------------------------------------

    pub fn probe_binary(&self) -> BinaryStatus {
        let was_unknown = self.provisioner.status() == BinaryStatus::Unknown;
        let status = self.provisioner.probe();
        if was_unknown {
            let path = self.settings.binary_path.display();
            match status {
                BinaryStatus::Complete => self.events.info(&format!("V2Ray found at {}", path)),
                _ => self.events.warn(&format!("V2Ray not found at {}", path)),
            }
        }
        status
    }

    pub fn set_proxy_url(&self, url: &str) {
        self.provisioner.set_proxy_url(url);
    }

    /// Start the download if the binary is missing. The handle also records
    /// the outcome in the event log.
    pub fn begin_fetch(&self) -> Option<JoinHandle<Result<()>>> {
        let proxy = self.provisioner.status().proxy_url().map(str::to_string);
        let inner = self.provisioner.begin_fetch()?;
        match proxy {
            Some(p) => self.events.info(&format!("Start downloading V2Ray via {}", p)),
            None => self.events.info("Start downloading V2Ray"),
        }

        let events = Arc::clone(&self.events);
        Some(self.runtime.spawn(async move {
            let outcome = inner.await.unwrap_or_else(|e| {
                Err(LaunchError::NetworkFetchError(format!("download task failed: {}", e)))
            });
            match &outcome {
                Ok(()) => events.info("V2Ray download complete"),
                Err(e) => events.error(&format!("V2Ray download failed: {}", e)),
            }
            outcome
        }))
    }

    // -----------------------------------------------------------------------
    // Process
    // -----------------------------------------------------------------------

    pub async fn start(&mut self) -> Result<ProcessStatus> {
        self.events.info("Start V2Ray");
        match self.supervisor.start(&self.settings.config_path).await {
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    self.events.info(&format!("V2Ray running (pid {})", pid));
                }
                self.observed = status;
                Ok(status)
            }
            Err(e) => {
                self.events.error(&e.to_string());
                Err(e)
            }
        }
    }

    pub fn stop(&mut self) {
        if self.supervisor.status().is_running() {
            self.events.info("Stop V2Ray");
        }
        self.supervisor.stop();
        self.observed = self.supervisor.status();
    }

    /// Align the process with the binary state and report exits seen since
    /// the last call. Front ends call this every frame, so it never waits:
    /// a process that must go is signalled and killed after the grace
    /// interval by its monitor.
    pub fn reconcile(&mut self) -> ProcessStatus {
        let current = self.supervisor.status();
        if current.is_running() && self.provisioner.status() != BinaryStatus::Complete {
            self.events.warn("V2Ray binary is not ready; stopping process");
            self.supervisor.stop();
        }

        let now = self.supervisor.status();
        if now != self.observed {
            if let (ProcessStatus::Running { .. }, ProcessStatus::Stopped { exit_code }) = (self.observed, now) {
                match now.check() {
                    Err(LaunchError::ProcessAbnormalExit(code)) => {
                        self.events.error(&format!("Failed to launch V2Ray: {}", code))
                    }
                    _ => self.events.info(&format!("V2Ray exited with code {}", exit_code)),
                }
            }
            self.observed = now;
        }
        now
    }

    // -----------------------------------------------------------------------
    // Config file
    // -----------------------------------------------------------------------

    pub fn reload_config(&self) -> Result<String> {
        self.config.load_or_create()
    }

    pub fn save_config(&self, text: &str) -> Result<()> {
        self.config.save(text).map_err(|e| {
            self.events.error(&format!("Failed to save config: {}", e));
            e
        })
    }

    /// Stop the process and wait for it, bounded by the grace interval.
    pub async fn shutdown(&mut self) {
        self.supervisor.shutdown().await;
        self.observed = self.supervisor.status();
        self.events.info("Exiting");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
