use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use snapfreeze::archive::ArchiveManifest;

pub const DATA_DIR: &str = "data";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SUMMARY_FILE: &str = "backup.json";

/// Run record written next to the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupSummary {
    pub name: String,
    pub source_path: PathBuf,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub lock_driver: String,
    pub snapshot_name: String,
    pub snapshot_size: u64,
    pub members: usize,
    pub bytes: u64,
    pub compressed_bytes: u64,
}

/// `<backup-directory>/<YYYYmmddHHMMSS>_<name>`
pub fn backup_dir_for(root: &Path, name: &str) -> PathBuf {
    let ts = Local::now().format("%Y%m%d%H%M%S");
    root.join(format!("{}_{}", ts, sanitize(name)))
}

pub fn data_dir(backup_dir: &Path) -> PathBuf {
    backup_dir.join(DATA_DIR)
}

/// Create the run directory; it must not exist yet.
pub fn create_backup_dir(root: &Path, name: &str) -> Result<PathBuf> {
    fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
    let dir = backup_dir_for(root, name);
    if dir.exists() {
        return Err(anyhow!("backup directory {} already exists", dir.display()));
    }
    fs::create_dir(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir)
}

pub fn save_manifest(backup_dir: &Path, manifest: &ArchiveManifest) -> Result<()> {
    let content = serde_json::to_string_pretty(manifest)?;
    fs::write(backup_dir.join(MANIFEST_FILE), content)?;
    Ok(())
}

pub fn load_manifest(backup_dir: &Path) -> Result<ArchiveManifest> {
    let path = backup_dir.join(MANIFEST_FILE);
    let content = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let manifest: ArchiveManifest = serde_json::from_str(&content)?;
    Ok(manifest)
}

pub fn save_summary(backup_dir: &Path, summary: &BackupSummary) -> Result<()> {
    let content = serde_json::to_string_pretty(summary)?;
    fs::write(backup_dir.join(SUMMARY_FILE), content)?;
    Ok(())
}

pub fn load_summary(backup_dir: &Path) -> Result<BackupSummary> {
    let path = backup_dir.join(SUMMARY_FILE);
    let content = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let summary: BackupSummary = serde_json::from_str(&content)?;
    Ok(summary)
}

/// Backup runs under `root`, oldest first.
pub fn list_backups(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut runs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.join(MANIFEST_FILE).is_file())
        .collect();
    runs.sort();
    Ok(runs)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapfreeze::archive::{ArchiveMember, Compression};

    fn manifest() -> ArchiveManifest {
        ArchiveManifest {
            members: vec![ArchiveMember {
                logical_unit: "backup".into(),
                file_name: "backup.tar.zst".into(),
                file_count: 3,
                byte_count: 4096,
                compressed_byte_count: 512,
                checksum: "ab".into(),
            }],
            compression: Compression::default(),
            compression_deferred: false,
            replication: None,
            freeze_ms: Some(40),
            snapshot: None,
        }
    }

    #[test]
    fn test_backup_dir_name_is_sanitized() {
        let dir = backup_dir_for(Path::new("/backups"), "nightly db/1");
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("_nightly_db_1"));
        assert_eq!(name.len(), "YYYYmmddHHMMSS_".len() + "nightly_db_1".len());
    }

    #[test]
    fn test_manifest_roundtrip_and_listing() {
        let root = tempfile::tempdir().unwrap();
        let dir = create_backup_dir(root.path(), "nightly").unwrap();
        assert!(list_backups(root.path()).unwrap().is_empty());

        save_manifest(&dir, &manifest()).unwrap();
        assert_eq!(load_manifest(&dir).unwrap(), manifest());
        assert_eq!(list_backups(root.path()).unwrap(), vec![dir]);
    }

    #[test]
    fn test_summary_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let dir = create_backup_dir(root.path(), "nightly").unwrap();

        let now = Local::now();
        let summary = BackupSummary {
            name: "nightly".into(),
            source_path: "/var/lib/mysql".into(),
            started_at: now,
            finished_at: now,
            lock_driver: "mysql".into(),
            snapshot_name: "data_snapshot".into(),
            snapshot_size: 1 << 30,
            members: 1,
            bytes: 4096,
            compressed_bytes: 512,
        };
        save_summary(&dir, &summary).unwrap();
        let back = load_summary(&dir).unwrap();
        assert_eq!(back.snapshot_name, "data_snapshot");
        assert_eq!(back.compressed_bytes, 512);

        let raw = fs::read_to_string(dir.join(SUMMARY_FILE)).unwrap();
        assert!(raw.contains("\"lock-driver\": \"mysql\""));
    }
}
