use anyhow::{Context, Result, anyhow};
use chrono::Local;
use colored::*;
use comfy_table::{Attribute, Cell, ContentArrangement, Table, presets::UTF8_FULL};
use indicatif::{ProgressBar, ProgressStyle};
use rpassword::read_password;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use snapfreeze::archive::{ArchiveManifest, TarStreamer};
use snapfreeze::config::{self, BackupSetConfig};
use snapfreeze::events::{BackupEvent, EventSink, LogSink};
use snapfreeze::lock::mysql::query_datadir;
use snapfreeze::lock::{LockCoordinator, LockDriver, MySqlFlushLock, NoLock};
use snapfreeze::orchestrator::{BackupPlan, Orchestrator};
use snapfreeze::snapshot::{LvmSnapshots, SnapshotManager};
use snapfreeze::utils::fmt::{format_bytes, format_interval};
use snapfreeze::utils::hash::sha256_file;
use snapfreeze::volume::{LvmInspector, VolumeDescriptor, VolumeInspector};

use crate::storage::{self, BackupSummary};

pub fn do_backup(config_path: &Path, ask_password: bool) -> Result<()> {
    let cfg = load_config(config_path, ask_password)?;
    let source = resolve_source(&cfg)?;
    let run_dir = storage::create_backup_dir(&cfg.backup_directory, &cfg.name)?;
    let request = cfg.to_request(&source, &storage::data_dir(&run_dir))?;

    let started_at = Local::now();
    let bar = create_progress_bar("Starting backup");
    let mut orchestrator = build_orchestrator(&cfg).with_events(Arc::new(ProgressSink { bar: bar.clone() }));
    let manifest = match orchestrator.run(&request) {
        Ok(manifest) => manifest,
        Err(err) => {
            bar.finish_and_clear();
            // data/ is already gone; only an empty run directory may remain
            if let Err(e) = fs::remove_dir(&run_dir) {
                warn!("Could not remove {}: {}", run_dir.display(), e);
            }
            return Err(err).with_context(|| format!("backup '{}' failed", cfg.name));
        }
    };
    bar.finish_and_clear();

    let summary = BackupSummary {
        name: cfg.name.clone(),
        source_path: source,
        started_at,
        finished_at: Local::now(),
        lock_driver: orchestrator.lock_driver().to_string(),
        snapshot_name: manifest.snapshot.as_ref().map(|s| s.name.clone()).unwrap_or_default(),
        snapshot_size: manifest.snapshot.as_ref().map(|s| s.size_bytes).unwrap_or_default(),
        members: manifest.members.len(),
        bytes: manifest.total_bytes(),
        compressed_bytes: manifest.total_compressed_bytes(),
    };
    storage::save_manifest(&run_dir, &manifest)?;
    storage::save_summary(&run_dir, &summary)?;

    print_manifest(&manifest);
    if let Some(ms) = manifest.freeze_ms {
        println!(
            "{} {}",
            "i".yellow().bold(),
            format!("Writes were frozen for {}", format_interval(std::time::Duration::from_millis(ms))).yellow()
        );
    }
    if let Some(rep) = &manifest.replication {
        println!(
            "{} {}",
            "i".yellow().bold(),
            format!("Binary log position: {}:{}", rep.log_file, rep.log_position).yellow()
        );
    }
    if manifest.compression_deferred {
        println!(
            "{} {}",
            "!".yellow().bold(),
            "Members were written uncompressed; compression is left to a later pass".yellow()
        );
    }
    println!(
        "{} {}",
        "✔".green().bold(),
        format!("Backup '{}' written to {}", cfg.name, run_dir.display()).green()
    );
    Ok(())
}

pub fn do_dry_run(config_path: &Path, ask_password: bool) -> Result<()> {
    let cfg = load_config(config_path, ask_password)?;
    let source = resolve_source(&cfg)?;
    let output_dir = storage::data_dir(&storage::backup_dir_for(&cfg.backup_directory, &cfg.name));
    let request = cfg.to_request(&source, &output_dir)?;
    let plan = build_orchestrator(&cfg).plan(&request)?;

    print_plan(&source, &plan, &output_dir);
    println!("{} {}", "i".yellow().bold(), "Dry run: nothing was changed".yellow());
    Ok(())
}

pub fn do_inspect(path: &Path) -> Result<()> {
    let volume = LvmInspector::new().resolve(path)?;
    let mut table = new_table(vec!["Field", "Value"]);
    add_volume_rows(&mut table, &volume);
    println!("{}", table);
    Ok(())
}

pub fn do_verify(backup_dir: &Path) -> Result<()> {
    let manifest = storage::load_manifest(backup_dir)?;
    let data = storage::data_dir(backup_dir);
    let bar = create_progress_bar("Verifying archive members");

    let mut table = new_table(vec!["Unit", "File", "Size", "Status"]);
    let mut bad = 0usize;
    for member in &manifest.members {
        bar.set_message(format!("Verifying {}", member.file_name));
        let path = data.join(&member.file_name);
        let status = match fs::metadata(&path) {
            Err(e) => Err(format!("missing: {}", e)),
            Ok(meta) if meta.len() != member.compressed_byte_count => Err(format!(
                "size {} != {}",
                meta.len(),
                member.compressed_byte_count
            )),
            Ok(_) => match sha256_file(&path) {
                Ok(sum) if sum == member.checksum => Ok(()),
                Ok(_) => Err("checksum mismatch".to_string()),
                Err(e) => Err(format!("unreadable: {}", e)),
            },
        };
        let status_cell = match status {
            Ok(()) => Cell::new("ok".green()),
            Err(reason) => {
                bad += 1;
                Cell::new(reason.red())
            }
        };
        table.add_row(vec![
            Cell::new(&member.logical_unit),
            Cell::new(&member.file_name),
            Cell::new(format_bytes(member.compressed_byte_count)),
            status_cell,
        ]);
    }
    bar.finish_and_clear();

    println!("{}", table);
    if bad > 0 {
        return Err(anyhow!(
            "{} of {} archive member(s) failed verification",
            bad,
            manifest.members.len()
        ));
    }
    println!(
        "{} {}",
        "✔".green().bold(),
        format!("All {} member(s) match the manifest", manifest.members.len()).green()
    );
    Ok(())
}

pub fn do_list(config_path: &Path) -> Result<()> {
    let cfg = config::load(config_path)?;
    let mut rows = Vec::new();
    for dir in storage::list_backups(&cfg.backup_directory)? {
        match storage::load_summary(&dir) {
            Ok(summary) if summary.name == cfg.name => rows.push((dir, summary)),
            Ok(_) => {}
            Err(e) => warn!("Skipping {}: {}", dir.display(), e),
        }
    }

    if rows.is_empty() {
        println!("{} {}", "i".yellow().bold(), "No backups found".yellow());
        return Ok(());
    }

    let mut table = new_table(vec!["Backup", "Started", "Duration", "Members", "Size", "Written"]);
    for (dir, s) in &rows {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let took = (s.finished_at - s.started_at).to_std().unwrap_or_default();
        table.add_row(vec![
            Cell::new(name),
            Cell::new(s.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(format_interval(took)),
            Cell::new(s.members),
            Cell::new(format_bytes(s.bytes)),
            Cell::new(format_bytes(s.compressed_bytes)),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub fn do_version() {
    println!("{} {}", "snapfreeze".bold(), env!("CARGO_PKG_VERSION").cyan());
}

fn load_config(path: &Path, ask_password: bool) -> Result<BackupSetConfig> {
    let mut cfg = config::load(path).with_context(|| format!("loading backup set {}", path.display()))?;
    if ask_password {
        let password = prompt_password("MySQL password: ")?;
        cfg.mysql_client.password = Some(password);
    }
    Ok(cfg)
}

/// Configured source path, or the server's datadir.
fn resolve_source(cfg: &BackupSetConfig) -> Result<PathBuf> {
    if let Some(path) = &cfg.source_path {
        return Ok(path.clone());
    }
    let datadir = query_datadir(&cfg.connection()).map_err(|e| anyhow!("cannot discover the MySQL datadir: {}", e))?;
    println!(
        "{} {}",
        "i".yellow().bold(),
        format!("Using MySQL datadir {}", datadir.display()).yellow()
    );
    Ok(datadir)
}

fn build_orchestrator(cfg: &BackupSetConfig) -> Orchestrator {
    let driver: Box<dyn LockDriver> = if cfg.lock.lock_tables {
        Box::new(MySqlFlushLock::new(&cfg.connection()))
    } else {
        Box::new(NoLock)
    };
    let lock = LockCoordinator::new(driver).with_timeout(cfg.freeze_timeout(), cfg.lock.freeze_attempts);
    let backend = LvmSnapshots::new()
        .with_mount_options(cfg.snapshot.snapshot_mount_options.clone())
        .with_create_options(cfg.snapshot.snapshot_create_options.clone())
        .with_mount_timeout(cfg.mount_timeout());
    Orchestrator::new(
        Box::new(LvmInspector::new()),
        lock,
        SnapshotManager::new(Box::new(backend)),
        Box::new(TarStreamer),
    )
}

/// Drives the spinner from run events and forwards them to the log.
struct ProgressSink {
    bar: ProgressBar,
}

impl EventSink for ProgressSink {
    fn emit(&self, event: &BackupEvent) {
        self.bar.suspend(|| LogSink.emit(event));
        let message = match event {
            BackupEvent::RunStarted { source } => format!("Resolving volume for {}", source.display()),
            BackupEvent::VolumeResolved { device, snapshot_size } => {
                format!("Snapshotting {} ({})", device.display(), format_bytes(*snapshot_size))
            }
            BackupEvent::FreezeStarted => "Writes frozen; creating snapshot".to_string(),
            BackupEvent::SnapshotCreated { device } => format!("Created {}", device.display()),
            BackupEvent::FreezeEnded { held_ms } => format!("Writes resumed after {} ms", held_ms),
            BackupEvent::SnapshotMounted { path } => format!("Mounted at {}", path.display()),
            BackupEvent::UnitStarted { unit } => format!("Archiving {}", unit),
            BackupEvent::UnitCompleted { unit, compressed_bytes, .. } => {
                format!("Archived {} ({})", unit, format_bytes(*compressed_bytes))
            }
            BackupEvent::SnapshotRemoved { .. } => "Snapshot removed".to_string(),
            BackupEvent::RunFinished { .. } => return,
        };
        self.bar.set_message(message);
    }
}

fn print_plan(source: &Path, plan: &BackupPlan, output_dir: &Path) {
    let mut table = new_table(vec!["Field", "Value"]);
    table.add_row(vec![Cell::new("Source"), Cell::new(source.display())]);
    add_volume_rows(&mut table, &plan.volume);
    let mount = match &plan.mount_path {
        Some(path) => path.display().to_string(),
        None => "temporary directory".to_string(),
    };
    let compression = &plan.archive_policy.compression;
    let rows: Vec<(&str, String)> = vec![
        ("Snapshot name", plan.snapshot_name.clone()),
        ("Snapshot size", format_bytes(plan.snapshot_size)),
        ("Mount path", mount),
        ("Archive path", plan.archive_path.display().to_string()),
        ("Estimated data", format_bytes(plan.estimated_bytes)),
        ("Lock driver", plan.lock_driver.to_string()),
        ("Pre-flush", yes_no(plan.lock_policy.pre_flush)),
        ("Freeze writes", yes_no(plan.lock_policy.freeze_for_snapshot)),
        ("Per-database members", yes_no(plan.archive_policy.per_logical_unit)),
        (
            "Compression",
            format!(
                "{:?} level {}{}",
                compression.method,
                compression.level,
                if compression.deferred() { " (deferred)" } else { "" }
            )
            .to_lowercase(),
        ),
        ("Exclude", plan.archive_policy.exclude.join(", ")),
        ("Output", output_dir.display().to_string()),
    ];
    for (field, value) in rows {
        table.add_row(vec![Cell::new(field), Cell::new(value)]);
    }
    println!("{}", table);
}

fn print_manifest(manifest: &ArchiveManifest) {
    let mut table = new_table(vec!["Unit", "File", "Files", "Size", "Written", "SHA-256"]);
    for m in &manifest.members {
        table.add_row(vec![
            Cell::new(&m.logical_unit),
            Cell::new(&m.file_name),
            Cell::new(m.file_count),
            Cell::new(format_bytes(m.byte_count)),
            Cell::new(format_bytes(m.compressed_byte_count)),
            Cell::new(m.checksum.get(..12).unwrap_or(&m.checksum)),
        ]);
    }
    println!("{}", table);
}

fn add_volume_rows(table: &mut Table, volume: &VolumeDescriptor) {
    let rows: Vec<(&str, String)> = vec![
        ("Device", volume.device_path.display().to_string()),
        ("Volume group", volume.volume_group.clone()),
        ("Logical volume", volume.logical_volume.clone()),
        ("Volume size", format_bytes(volume.lv_size)),
        ("Extent size", format_bytes(volume.extent_size)),
        (
            "VG free",
            format!(
                "{} ({} of {} extents)",
                format_bytes(volume.free_bytes()),
                volume.free_extents,
                volume.total_extents
            ),
        ),
        ("Mount point", volume.mount_point.display().to_string()),
        ("Filesystem", volume.fs_type.clone()),
    ];
    for (field, value) in rows {
        table.add_row(vec![Cell::new(field), Cell::new(value)]);
    }
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .into_iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect::<Vec<_>>(),
        );
    table
}

fn yes_no(value: bool) -> String {
    let text = if value { "yes" } else { "no" };
    text.to_string()
}

fn create_progress_bar(prefix: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "),
    );
    bar.set_message(prefix.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar
}

fn prompt_password(message: &str) -> Result<String> {
    print!("{} {}", "?".cyan().bold(), message.cyan());
    std::io::Write::flush(&mut std::io::stdout())?;
    let password = read_password()?;
    Ok(password)
}
