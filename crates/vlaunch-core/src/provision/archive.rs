//! Single-entry zip extraction.

use crate::error::Result;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use tracing::debug;

/// Copy the first entry whose file name equals `entry_name` into `out_path`.
///
/// Entries are scanned in archive order. The output file is always created;
/// when nothing matches it is left empty and `Ok(0)` is returned.
pub fn extract_entry<R: Read + Seek>(reader: R, entry_name: &str, out_path: &Path) -> Result<u64> {
    let mut archive = zip::ZipArchive::new(reader)?;
    let mut out = File::create(out_path)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || !name_matches(entry.name(), entry_name) {
            continue;
        }
        debug!(entry = entry.name(), size = entry.size(), "extracting archive entry");
        let written = std::io::copy(&mut entry, &mut out)?;
        out.sync_all()?;
        return Ok(written);
    }

    Ok(0)
}

fn name_matches(entry: &str, wanted: &str) -> bool {
    entry == wanted || entry.rsplit('/').next() == Some(wanted)
}

#[cfg(test)]
pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zw = zip::ZipWriter::new(&mut buf);
        for (name, data) in entries {
            zw.start_file(*name, SimpleFileOptions::default()).unwrap();
            zw.write_all(data).unwrap();
        }
        zw.finish().unwrap();
    }
    buf.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchError;
    use std::io::Cursor;

    #[test]
    fn test_extracts_matching_entry() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        let zip = build_zip(&[
            ("README.md", b"readme"),
            ("v2ray", &payload),
            ("config.json", b"{}"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("v2ray");

        let n = extract_entry(Cursor::new(zip), "v2ray", &out).unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(std::fs::read(&out).unwrap(), payload);
    }

    #[test]
    fn test_first_match_wins() {
        let zip = build_zip(&[("bin/v2ray", b"first"), ("v2ray", b"second")]);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("v2ray");

        extract_entry(Cursor::new(zip), "v2ray", &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"first");
    }

    #[test]
    fn test_no_match_leaves_empty_file() {
        let zip = build_zip(&[("v2ctl", b"ctl"), ("geoip.dat", b"geo")]);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("v2ray");

        let n = extract_entry(Cursor::new(zip), "v2ray", &out).unwrap();
        assert_eq!(n, 0);
        assert!(out.exists());
        assert!(std::fs::read(&out).unwrap().is_empty());
    }

    #[test]
    fn test_not_a_zip() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("v2ray");
        let err = extract_entry(Cursor::new(b"<html>rate limited</html>".to_vec()), "v2ray", &out)
            .unwrap_err();
        assert!(matches!(err, LaunchError::ArchiveExtractionError(_)));
    }

    #[test]
    fn test_name_matches() {
        assert!(name_matches("v2ray.exe", "v2ray.exe"));
        assert!(name_matches("v2ray-windows-64/v2ray.exe", "v2ray.exe"));
        assert!(!name_matches("wv2ray.exe", "v2ray.exe"));
        assert!(!name_matches("v2ray.exe.sig", "v2ray.exe"));
    }
}
