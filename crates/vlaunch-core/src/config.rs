use anyhow::{anyhow, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Platform defaults
// ---------------------------------------------------------------------------

const RELEASE_BASE: &str = "https://github.com/v2fly/v2ray-core/releases/download/v4.45.0";

#[cfg(windows)]
const DEFAULT_BINARY: &str = "v2ray.exe";
#[cfg(not(windows))]
const DEFAULT_BINARY: &str = "v2ray";

fn default_archive_url() -> String {
    let asset = if cfg!(windows) {
        "v2ray-windows-64.zip"
    } else if cfg!(target_os = "macos") {
        if cfg!(target_arch = "aarch64") {
            "v2ray-macos-arm64-v8a.zip"
        } else {
            "v2ray-macos-64.zip"
        }
    } else if cfg!(target_arch = "aarch64") {
        "v2ray-linux-arm64-v8a.zip"
    } else {
        "v2ray-linux-64.zip"
    };
    format!("{}/{}", RELEASE_BASE, asset)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LauncherSettings {
    pub binary_path: PathBuf,
    pub config_path: PathBuf,
    pub archive_url: String,
    /// Archive entry holding the binary; defaults to the binary's file name.
    pub archive_entry: String,
    /// Forward proxy used for the download. Empty means direct.
    pub proxy_url: String,
    pub shutdown_grace_secs: u64,
    pub log_path: String,
    pub log_level: String,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        LauncherSettings {
            binary_path: PathBuf::from(DEFAULT_BINARY),
            config_path: PathBuf::from("config.json"),
            archive_url: default_archive_url(),
            archive_entry: DEFAULT_BINARY.to_string(),
            proxy_url: String::new(),
            shutdown_grace_secs: 5,
            log_path: "vlaunch.log".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl LauncherSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn proxy_url(&self) -> Option<&str> {
        let url = self.proxy_url.trim();
        (!url.is_empty()).then_some(url)
    }

    /// Load from `path`, falling back to defaults when it is absent or broken.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("Settings file '{}' not found, using defaults.", path.display());
            return LauncherSettings::default();
        }
        Self::load_from_file(path).unwrap_or_else(|e| {
            warn!("Failed to load settings '{}': {}. Using defaults.", path.display(), e);
            LauncherSettings::default()
        })
    }

    /// Load settings from an XML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read settings file '{}': {}", path.display(), e))?;
        Self::from_xml(&content)
    }

    /// Save settings to an XML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let xml = self.to_xml();
        let mut file = std::fs::File::create(path)
            .map_err(|e| anyhow!("Failed to create settings file '{}': {}", path.display(), e))?;
        file.write_all(xml.as_bytes())
            .map_err(|e| anyhow!("Failed to write settings file: {}", e))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // XML serialization
    // -----------------------------------------------------------------------

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<vlaunch>\n");
        out.push_str("  <settings>\n");
        let fields = [
            ("binary_path", self.binary_path.display().to_string()),
            ("config_path", self.config_path.display().to_string()),
            ("archive_url", self.archive_url.clone()),
            ("archive_entry", self.archive_entry.clone()),
            ("proxy_url", self.proxy_url.clone()),
            ("shutdown_grace_secs", self.shutdown_grace_secs.to_string()),
            ("log_path", self.log_path.clone()),
            ("log_level", self.log_level.clone()),
        ];
        for (tag, value) in fields {
            out.push_str(&format!("    <{tag}>{}</{tag}>\n", xml_escape(&value)));
        }
        out.push_str("  </settings>\n");
        out.push_str("</vlaunch>\n");
        out
    }

    // -----------------------------------------------------------------------
    // XML deserialization
    // -----------------------------------------------------------------------

    /// Missing elements keep their defaults.
    pub fn from_xml(xml: &str) -> Result<Self> {
        use quick_xml::events::Event;
        use quick_xml::Reader;

        let mut settings = LauncherSettings::default();
        let mut entry_set = false;
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut in_settings = false;
        let mut current_tag = String::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    let name = std::str::from_utf8(e.name().as_ref())?.to_string();
                    if name == "settings" {
                        in_settings = true;
                    } else if in_settings {
                        current_tag = name;
                    }
                }
                Ok(Event::Text(ref e)) => {
                    if in_settings && !current_tag.is_empty() {
                        let text = e.unescape()?.to_string();
                        match current_tag.as_str() {
                            "binary_path" => settings.binary_path = PathBuf::from(text),
                            "config_path" => settings.config_path = PathBuf::from(text),
                            "archive_url" => settings.archive_url = text,
                            "archive_entry" => {
                                settings.archive_entry = text;
                                entry_set = true;
                            }
                            "proxy_url" => settings.proxy_url = text,
                            "shutdown_grace_secs" => {
                                settings.shutdown_grace_secs = text
                                    .parse()
                                    .map_err(|_| anyhow!("Invalid shutdown_grace_secs: {}", text))?
                            }
                            "log_path" => settings.log_path = text,
                            "log_level" => settings.log_level = text,
                            _ => {}
                        }
                        current_tag.clear();
                    }
                }
                Ok(Event::End(ref e)) => {
                    let name = std::str::from_utf8(e.name().as_ref())?.to_string();
                    if name == "settings" {
                        in_settings = false;
                    }
                    current_tag.clear();
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(anyhow!("XML parse error: {}", e)),
                _ => {}
            }
            buf.clear();
        }

        if !entry_set {
            if let Some(name) = settings.binary_path.file_name() {
                settings.archive_entry = name.to_string_lossy().into_owned();
            }
        }

        Ok(settings)
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
