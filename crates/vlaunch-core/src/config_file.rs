//! The proxy core's own configuration file, edited as plain text.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file, creating it empty first if it does not exist.
    pub fn load_or_create(&self) -> Result<String> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "Config file not found, creating empty one");
            self.ensure_parent()?;
            std::fs::write(&self.path, b"")?;
            return Ok(String::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        debug!(path = %self.path.display(), bytes = text.len(), "Config loaded");
        Ok(text)
    }

    /// Overwrite the file with `text`.
    pub fn save(&self, text: &str) -> Result<()> {
        self.ensure_parent()?;
        std::fs::write(&self.path, text)?;
        debug!(path = %self.path.display(), bytes = text.len(), "Config saved");
        Ok(())
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchError;

    #[test]
    fn test_created_empty_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("conf").join("config.json"));
        assert_eq!(file.load_or_create().unwrap(), "");
        assert!(file.path().exists());
        assert_eq!(std::fs::metadata(file.path()).unwrap().len(), 0);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("config.json"));
        let text = "{\n  \"inbounds\": [{\"port\": 1080, \"tag\": \"代理\"}]\n}\n";
        file.save(text).unwrap();
        assert_eq!(file.load_or_create().unwrap(), text);
    }

    #[test]
    fn test_existing_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();
        assert_eq!(ConfigFile::new(&path).load_or_create().unwrap(), "{}");
    }

    #[test]
    fn test_non_utf8_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, [0xff, 0xfe, 0x00]).unwrap();
        let err = ConfigFile::new(&path).load_or_create().unwrap_err();
        assert!(matches!(err, LaunchError::Io(_)));
    }
}
