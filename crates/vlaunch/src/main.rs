/// vlaunch – headless launcher for the V2Ray core.
///
/// Downloads the binary when it is missing, runs it in the foreground with
/// the configured `config.json`, and tears it down on Ctrl-C.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vlaunch_core::{BinaryStatus, LaunchError, Launcher, LauncherSettings, ProcessStatus};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "vlaunch", about = "vlaunch – download and run the V2Ray core")]
struct Cli {
    /// Path to the XML settings file
    #[arg(short, long, default_value = "vlaunch.xml")]
    settings: PathBuf,

    /// Forward proxy for the download (http, socks4 or socks5 URL)
    #[arg(long)]
    proxy: Option<String>,

    /// Override the V2Ray config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the V2Ray binary path
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Make sure the binary is present and exit
    #[arg(long)]
    fetch_only: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn settings(&self) -> LauncherSettings {
        let mut settings = LauncherSettings::load_or_default(&self.settings);
        if let Some(binary) = &self.binary {
            settings.binary_path = binary.clone();
            if let Some(name) = binary.file_name() {
                settings.archive_entry = name.to_string_lossy().into_owned();
            }
        }
        if let Some(config) = &self.config {
            settings.config_path = config.clone();
        }
        if let Some(proxy) = &self.proxy {
            settings.proxy_url = proxy.clone();
        }
        settings
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The log level lives in the settings, so they load before tracing is up.
    let settings = cli.settings();
    init_tracing(cli.verbose, &settings.log_level);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let code = rt.block_on(run(settings, cli.fetch_only))?;
    drop(rt);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn init_tracing(verbose: bool, level: &str) {
    let filter = if verbose { "debug" } else { level };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Returns the process exit code for vlaunch itself.
async fn run(settings: LauncherSettings, fetch_only: bool) -> Result<i32> {
    let proxy_url = settings.proxy_url().map(str::to_string);
    let mut launcher = Launcher::new(settings, tokio::runtime::Handle::current())?;

    ensure_binary(&launcher, proxy_url.as_deref()).await?;
    if fetch_only {
        return Ok(0);
    }

    launcher.reload_config()?;
    if let Err(e) = launcher.start().await {
        launcher.shutdown().await;
        return Err(e.into());
    }

    let mut status = launcher.subscribe_process();
    tokio::select! {
        res = status.wait_for(|s| !s.is_running()) => {
            if res.is_err() {
                warn!("Process status channel closed");
            }
        }
        res = tokio::signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Interrupted, stopping V2Ray"),
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
            launcher.stop();
        }
    }

    let last = launcher.reconcile();
    launcher.shutdown().await;
    Ok(exit_code(last))
}

async fn ensure_binary(launcher: &Launcher, proxy_url: Option<&str>) -> Result<()> {
    match launcher.probe_binary() {
        BinaryStatus::Complete => return Ok(()),
        status if status.is_missing() => {}
        other => bail!("Unexpected binary state: {:?}", other),
    }

    if let Some(url) = proxy_url {
        launcher.set_proxy_url(url);
    }
    let Some(handle) = launcher.begin_fetch() else {
        bail!("Download could not be started");
    };
    handle.await??;

    let binary = &launcher.settings().binary_path;
    if is_empty_file(binary) {
        warn!(
            "Archive had no entry named '{}'; {} is empty",
            launcher.settings().archive_entry,
            binary.display()
        );
    }
    Ok(())
}

fn is_empty_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false)
}

fn exit_code(status: ProcessStatus) -> i32 {
    match status.check() {
        Err(LaunchError::ProcessAbnormalExit(code)) => code,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let settings_path = dir.path().join("vlaunch.xml");
        let cli = Cli::parse_from([
            "vlaunch",
            "-s",
            settings_path.to_str().unwrap(),
            "--proxy",
            "socks5://127.0.0.1:1080",
            "--binary",
            "core/v2ray-beta",
            "--config",
            "client.json",
        ]);
        let s = cli.settings();
        assert_eq!(s.binary_path, PathBuf::from("core/v2ray-beta"));
        assert_eq!(s.archive_entry, "v2ray-beta");
        assert_eq!(s.config_path, PathBuf::from("client.json"));
        assert_eq!(s.proxy_url(), Some("socks5://127.0.0.1:1080"));
    }

    #[test]
    fn test_defaults_without_settings_file() {
        let cli = Cli::parse_from(["vlaunch", "-s", "/nonexistent/vlaunch.xml", "--fetch-only"]);
        assert!(cli.fetch_only);
        assert_eq!(cli.settings(), LauncherSettings::default());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(ProcessStatus::Stopped { exit_code: 0 }), 0);
        assert_eq!(exit_code(ProcessStatus::Stopped { exit_code: 1 }), 0);
        assert_eq!(exit_code(ProcessStatus::Stopped { exit_code: 143 }), 143);
        assert_eq!(exit_code(ProcessStatus::Running { pid: 1, run: 1 }), 0);
    }
}
