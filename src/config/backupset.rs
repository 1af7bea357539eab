use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::{ArchivePolicy, Compression};
use crate::error::{BackupError, Result};
use crate::lock::LockPolicy;
use crate::lock::mysql::MySqlConnection;
use crate::orchestrator::BackupRequest;
use crate::snapshot::validate_name;
use crate::utils::fmt::parse_bytes;
use crate::volume::{SizeLimits, SizePolicy};

/// One backup set, as read from its JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BackupSetConfig {
    pub name: String,
    pub backup_directory: PathBuf,
    /// Directory to back up; when absent the MySQL datadir is used
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    #[serde(default)]
    pub snapshot: SnapshotSection,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub mysql_client: MySqlClientSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SnapshotSection {
    pub snapshot_name: String,
    pub snapshot_size: String,
    pub snapshot_mountpoint: Option<PathBuf>,
    pub snapshot_mount_options: Vec<String>,
    /// Extra `lvcreate` arguments
    pub snapshot_create_options: Vec<String>,
    pub min_snapshot_size: String,
    pub reserve_percent: f64,
    /// Seconds
    pub mount_timeout: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            snapshot_name: String::new(),
            snapshot_size: String::new(),
            snapshot_mountpoint: None,
            snapshot_mount_options: Vec::new(),
            snapshot_create_options: Vec::new(),
            min_snapshot_size: "256M".into(),
            reserve_percent: 5.0,
            mount_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct LockSection {
    pub lock_tables: bool,
    pub extra_flush_tables: bool,
    /// Seconds per attempt
    pub freeze_timeout: u64,
    pub freeze_attempts: u32,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            lock_tables: true,
            extra_flush_tables: true,
            freeze_timeout: 30,
            freeze_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ArchiveSection {
    pub file_per_database: bool,
    pub exclude: Vec<String>,
    pub compression: Compression,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            file_per_database: true,
            exclude: vec!["lost+found".into()],
            compression: Compression::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct MySqlClientSection {
    pub defaults_extra_file: Option<PathBuf>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub socket: Option<PathBuf>,
    /// Client binary
    pub mysql: String,
}

impl Default for MySqlClientSection {
    fn default() -> Self {
        Self {
            defaults_extra_file: None,
            user: None,
            password: None,
            host: None,
            port: None,
            socket: None,
            mysql: "mysql".into(),
        }
    }
}

/// Read and validate a backup-set file.
pub fn load(path: &Path) -> Result<BackupSetConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| BackupError::InvalidConfig(format!("cannot read '{}': {}", path.display(), e)))?;
    let cfg: BackupSetConfig = serde_json::from_str(&content)
        .map_err(|e| BackupError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Name and size are always chosen by snapfreeze.
fn overrides_lvcreate(option: &str) -> bool {
    let option = option.trim();
    ["--name", "--extents", "--size", "-n", "-l", "-L"]
        .iter()
        .any(|flag| option == *flag || option.starts_with(&format!("{}=", flag)) || (flag.len() == 2 && option.starts_with(flag)))
}

fn invalid(option: &str, msg: impl std::fmt::Display) -> BackupError {
    BackupError::InvalidConfig(format!("{}: {}", option, msg))
}

impl BackupSetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("name", "must not be empty"));
        }
        if self.backup_directory.as_os_str().is_empty() {
            return Err(invalid("backup-directory", "must not be empty"));
        }
        if !self.snapshot.snapshot_name.is_empty() {
            validate_name(&self.snapshot.snapshot_name)?;
        }
        SizePolicy::parse(&self.snapshot.snapshot_size)?;
        self.size_limits()?;
        if let Some(opt) = self.snapshot.snapshot_create_options.iter().find(|o| overrides_lvcreate(o)) {
            return Err(invalid(
                "snapshot-create-options",
                format!("'{}' would override the snapshot name or size", opt),
            ));
        }
        if self.snapshot.mount_timeout == 0 {
            return Err(invalid("mount-timeout", "must be at least one second"));
        }
        if self.lock.freeze_timeout == 0 {
            return Err(invalid("freeze-timeout", "must be at least one second"));
        }
        if self.lock.freeze_attempts == 0 {
            return Err(invalid("freeze-attempts", "must be at least 1"));
        }
        if self.source_path.is_none() && !self.lock.lock_tables {
            return Err(invalid("source-path", "required when lock-tables is off"));
        }
        self.archive.compression.validate()
    }

    pub fn size_limits(&self) -> Result<SizeLimits> {
        let min_snapshot_size =
            parse_bytes(&self.snapshot.min_snapshot_size).map_err(|e| invalid("min-snapshot-size", e))?;
        let reserve_percent = self.snapshot.reserve_percent;
        if !(0.0..100.0).contains(&reserve_percent) {
            return Err(invalid("reserve-percent", format!("{} is not in [0, 100)", reserve_percent)));
        }
        Ok(SizeLimits { min_snapshot_size, reserve_percent })
    }

    /// Mount root, treating an empty `snapshot-mountpoint` as unset.
    pub fn mount_root(&self) -> Option<PathBuf> {
        self.snapshot
            .snapshot_mountpoint
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            pre_flush: self.lock.lock_tables && self.lock.extra_flush_tables,
            freeze_for_snapshot: self.lock.lock_tables,
        }
    }

    pub fn freeze_timeout(&self) -> Duration {
        Duration::from_secs(self.lock.freeze_timeout)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot.mount_timeout)
    }

    pub fn archive_policy(&self) -> ArchivePolicy {
        ArchivePolicy {
            per_logical_unit: self.archive.file_per_database,
            compression: self.archive.compression,
            exclude: self.archive.exclude.clone(),
        }
    }

    pub fn connection(&self) -> MySqlConnection {
        let client = &self.mysql_client;
        MySqlConnection {
            program: client.mysql.clone(),
            defaults_extra_file: client.defaults_extra_file.clone(),
            user: client.user.clone(),
            password: client.password.clone(),
            host: client.host.clone(),
            port: client.port,
            socket: client.socket.clone(),
        }
    }

    /// Build the request for one run of this backup set.
    pub fn to_request(&self, source_path: &Path, output_dir: &Path) -> Result<BackupRequest> {
        Ok(BackupRequest {
            source_path: source_path.to_path_buf(),
            snapshot_size: SizePolicy::parse(&self.snapshot.snapshot_size)?,
            size_limits: self.size_limits()?,
            snapshot_name_prefix: self.snapshot.snapshot_name.clone(),
            mount_root: self.mount_root(),
            lock_policy: self.lock_policy(),
            archive_policy: self.archive_policy(),
            output_dir: output_dir.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::CompressionMethod;

    const FULL: &str = r#"{
        "name": "nightly",
        "backup-directory": "/var/backups/snapfreeze",
        "source-path": "/var/lib/mysql",
        "snapshot": {
            "snapshot-name": "mysql_nightly",
            "snapshot-size": "30%FREE",
            "snapshot-mountpoint": "/mnt/snapfreeze",
            "snapshot-mount-options": ["noatime"],
            "snapshot-create-options": ["--addtag=nightly"],
            "min-snapshot-size": "1G",
            "reserve-percent": 10,
            "mount-timeout": 30
        },
        "lock": { "lock-tables": true, "extra-flush-tables": false, "freeze-timeout": 5, "freeze-attempts": 3 },
        "archive": {
            "file-per-database": false,
            "exclude": ["lost+found", "*.pid"],
            "compression": { "method": "zstd", "level": 9, "inline": false }
        },
        "mysql-client": { "user": "backup", "port": 3307 }
    }"#;

    fn write(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly.json");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_full_config() {
        let (_dir, path) = write(FULL);
        let cfg = load(&path).unwrap();
        let req = cfg.to_request(Path::new("/var/lib/mysql"), Path::new("/out")).unwrap();

        assert_eq!(req.snapshot_size, SizePolicy::PercentOfFree(0.30));
        assert_eq!(req.size_limits.min_snapshot_size, 1 << 30);
        assert_eq!(req.size_limits.reserve_percent, 10.0);
        assert_eq!(req.snapshot_name_prefix, "mysql_nightly");
        assert_eq!(req.mount_root, Some(PathBuf::from("/mnt/snapfreeze")));
        assert_eq!(req.lock_policy, LockPolicy { pre_flush: false, freeze_for_snapshot: true });
        assert!(!req.archive_policy.per_logical_unit);
        assert!(req.archive_policy.compression.deferred());
        assert_eq!(cfg.freeze_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.lock.freeze_attempts, 3);
        assert_eq!(cfg.snapshot.snapshot_create_options, vec!["--addtag=nightly"]);

        let conn = cfg.connection();
        assert_eq!(conn.user.as_deref(), Some("backup"));
        assert_eq!(conn.port, Some(3307));
        assert_eq!(conn.program, "mysql");
    }

    #[test]
    fn test_defaults() {
        let (_dir, path) = write(r#"{ "name": "db", "backup-directory": "/backups" }"#);
        let cfg = load(&path).unwrap();
        assert!(cfg.source_path.is_none());
        assert!(cfg.mount_root().is_none());
        assert_eq!(cfg.lock_policy(), LockPolicy::default());
        assert_eq!(cfg.size_limits().unwrap(), SizeLimits::default());
        let policy = cfg.archive_policy();
        assert!(policy.per_logical_unit);
        assert_eq!(policy.exclude, vec!["lost+found"]);
        assert_eq!(policy.compression.method, CompressionMethod::Zstd);
        assert_eq!(
            cfg.to_request(Path::new("/data"), Path::new("/out")).unwrap().snapshot_size,
            SizePolicy::default()
        );
    }

    #[test]
    fn test_empty_mountpoint_means_temporary() {
        let (_dir, path) = write(
            r#"{ "name": "db", "backup-directory": "/b", "snapshot": { "snapshot-mountpoint": "" } }"#,
        );
        assert!(load(&path).unwrap().mount_root().is_none());
    }

    #[test]
    fn test_invalid_options_are_reported() {
        for content in [
            r#"{ "name": "", "backup-directory": "/b" }"#,
            r#"{ "name": "db", "backup-directory": "/b", "snapshot": { "snapshot-name": "pvmove1" } }"#,
            r#"{ "name": "db", "backup-directory": "/b", "snapshot": { "snapshot-size": "lots" } }"#,
            r#"{ "name": "db", "backup-directory": "/b", "snapshot": { "reserve-percent": 100 } }"#,
            r#"{ "name": "db", "backup-directory": "/b", "snapshot": { "snapshot-create-options": ["--size=1G"] } }"#,
            r#"{ "name": "db", "backup-directory": "/b", "snapshot": { "snapshot-create-options": ["-nother"] } }"#,
            r#"{ "name": "db", "backup-directory": "/b", "lock": { "freeze-attempts": 0 } }"#,
            r#"{ "name": "db", "backup-directory": "/b", "lock": { "lock-tables": false } }"#,
            r#"{ "name": "db", "backup-directory": "/b", "archive": { "compression": { "level": 99 } } }"#,
            r#"{ "name": "db", "backup-directory": "/b", "unknown-option": 1 }"#,
        ] {
            let (_dir, path) = write(content);
            let err = load(&path).unwrap_err();
            assert!(matches!(err, BackupError::InvalidConfig(_)), "{content}: {err}");
        }
    }

    #[test]
    fn test_missing_file() {
        let err = load(Path::new("/nonexistent/snapfreeze.json")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
