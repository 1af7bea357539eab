use ::tar::{Builder, EntryType, Header, HeaderMode};
use ignore::gitignore::Gitignore;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use super::{
    ArchiveManifest, ArchiveMember, ArchivePolicy, ArchiveStreamer, CompressionMethod, SHARED_UNIT,
    StreamContext, WHOLE_TREE_UNIT,
};
use crate::error::{BackupError, Result};
use crate::events::BackupEvent;
use crate::utils::fmt::{format_bytes, format_interval};
use crate::utils::hash::Tally;
use crate::utils::io::{build_excluder, top_level_entries, walk_excluding};

/// Writes each logical unit as a tar member, `<unit>.tar[.zst]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarStreamer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
    Symlink,
}

struct Entry {
    path: PathBuf,
    kind: Kind,
}

/// One member to write: a name plus the top-level paths it covers.
struct Unit {
    name: String,
    roots: Vec<PathBuf>,
}

impl ArchiveStreamer for TarStreamer {
    fn run(&self, root: &Path, policy: &ArchivePolicy, ctx: &StreamContext<'_>) -> Result<ArchiveManifest> {
        policy.compression.validate()?;
        let excluder = build_excluder(root, &policy.exclude)
            .map_err(|e| BackupError::InvalidConfig(format!("exclude pattern: {}", e)))?;
        let units = plan_units(root, policy.per_logical_unit, &excluder)?;
        fs::create_dir_all(ctx.output_dir).map_err(|source| BackupError::ArchiveWriteFailed {
            path: ctx.output_dir.to_path_buf(),
            source,
        })?;

        if policy.compression.deferred() {
            info!(target: "snapfreeze::archive", "Compression deferred; writing uncompressed members");
        }
        let mut members = Vec::with_capacity(units.len());
        for unit in &units {
            ctx.cancel.check()?;
            members.push(write_member(root, unit, policy, &excluder, ctx)?);
        }

        Ok(ArchiveManifest {
            members,
            compression: policy.compression,
            compression_deferred: policy.compression.deferred(),
            replication: None,
            freeze_ms: None,
            snapshot: None,
        })
    }
}

fn read_failed(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::ArchiveReadFailed { path: path.to_path_buf(), source }
}

fn write_failed(path: &Path) -> impl FnOnce(io::Error) -> BackupError + '_ {
    move |source| BackupError::ArchiveWriteFailed { path: path.to_path_buf(), source }
}

fn plan_units(root: &Path, per_logical_unit: bool, excluder: &Gitignore) -> Result<Vec<Unit>> {
    let (dirs, others) = top_level_entries(root, excluder).map_err(read_failed(root))?;

    if !per_logical_unit {
        let mut roots = dirs;
        roots.extend(others);
        roots.sort();
        return Ok(vec![Unit { name: WHOLE_TREE_UNIT.to_string(), roots }]);
    }

    let mut units: Vec<Unit> = dirs
        .into_iter()
        .map(|dir| Unit {
            name: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            roots: vec![dir],
        })
        .collect();
    if !others.is_empty() {
        let name = shared_unit_name(&units);
        units.push(Unit { name, roots: others });
    }
    debug!(
        target: "snapfreeze::archive",
        "Logical units: {}",
        units.iter().map(|u| u.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    Ok(units)
}

/// `_shared`, or `_shared_<n>` when a database directory already took it.
fn shared_unit_name(units: &[Unit]) -> String {
    let taken = |name: &str| units.iter().any(|u| u.name == name);
    let mut name = SHARED_UNIT.to_string();
    let mut n = 0;
    while taken(&name) {
        n += 1;
        name = format!("{}_{}", SHARED_UNIT, n);
    }
    name
}

/// Every entry a unit covers, in archive order.
fn list_entries(unit: &Unit, excluder: &Gitignore) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for root in &unit.roots {
        let meta = fs::symlink_metadata(root).map_err(read_failed(root))?;
        let Some(kind) = kind_of(meta.file_type()) else {
            debug!(target: "snapfreeze::archive", "Skipping special file {}", root.display());
            continue;
        };
        entries.push(Entry { path: root.clone(), kind });
        if kind != Kind::Dir {
            continue;
        }
        for item in walk_excluding(root, excluder) {
            let item = item.map_err(|(path, source)| BackupError::ArchiveReadFailed { path, source })?;
            match kind_of(item.file_type()) {
                Some(kind) => entries.push(Entry { path: item.into_path(), kind }),
                None => debug!(target: "snapfreeze::archive", "Skipping special file {}", item.path().display()),
            }
        }
    }
    Ok(entries)
}

fn kind_of(file_type: fs::FileType) -> Option<Kind> {
    if file_type.is_symlink() {
        Some(Kind::Symlink)
    } else if file_type.is_dir() {
        Some(Kind::Dir)
    } else if file_type.is_file() {
        Some(Kind::File)
    } else {
        None
    }
}

/// Plain or compressing stage between the tar stream and the file.
enum Encoder<W: Write> {
    Plain(W),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Plain(w) => Ok(w),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

/// Reader that remembers whether the failure came from the source side.
struct Tracked<R> {
    inner: R,
    read: u64,
    failed: bool,
}

impl<R: Read> Read for Tracked<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => {
                self.read += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }
}

fn write_member(
    root: &Path,
    unit: &Unit,
    policy: &ArchivePolicy,
    excluder: &Gitignore,
    ctx: &StreamContext<'_>,
) -> Result<ArchiveMember> {
    // listed up front so the member stream only ever reads file contents
    let entries = list_entries(unit, excluder)?;
    let compression = policy.compression;
    let extension = if compression.applied_inline() { compression.method.extension() } else { "" };
    let file_name = format!("{}.tar{}", unit.name, extension);
    let out_path = ctx.output_dir.join(&file_name);

    ctx.events.emit(&BackupEvent::UnitStarted { unit: unit.name.clone() });
    info!(target: "snapfreeze::archive", "Archiving '{}' ({} entries) to {}", unit.name, entries.len(), file_name);
    let start = Instant::now();

    let file = File::create(&out_path).map_err(write_failed(&out_path))?;
    let sink = Tally::hashing(BufWriter::new(file));
    let encoder = match compression.method {
        CompressionMethod::Zstd if compression.applied_inline() => {
            Encoder::Zstd(zstd::Encoder::new(sink, compression.level).map_err(write_failed(&out_path))?)
        }
        _ => Encoder::Plain(sink),
    };
    let mut builder = Builder::new(Tally::counting(encoder));
    builder.follow_symlinks(false);

    let mut file_count = 0u64;
    for entry in &entries {
        append_entry(&mut builder, root, entry, &out_path)?;
        if entry.kind == Kind::File {
            file_count += 1;
        }
    }

    let counted = builder.into_inner().map_err(write_failed(&out_path))?;
    let (encoder, byte_count, _) = counted.into_parts();
    let sink = encoder.finish().map_err(write_failed(&out_path))?;
    let (buffered, compressed_byte_count, checksum) = sink.into_parts();
    let file = buffered
        .into_inner()
        .map_err(|e| BackupError::ArchiveWriteFailed { path: out_path.clone(), source: e.into_error() })?;
    file.sync_all().map_err(write_failed(&out_path))?;

    info!(
        target: "snapfreeze::archive",
        "Archived '{}' in {}: {} files, {} -> {}",
        unit.name,
        format_interval(start.elapsed()),
        file_count,
        format_bytes(byte_count),
        format_bytes(compressed_byte_count)
    );
    ctx.events.emit(&BackupEvent::UnitCompleted {
        unit: unit.name.clone(),
        bytes: byte_count,
        compressed_bytes: compressed_byte_count,
    });

    Ok(ArchiveMember {
        logical_unit: unit.name.clone(),
        file_name,
        file_count,
        byte_count,
        compressed_byte_count,
        checksum: checksum.unwrap_or_default(),
    })
}

fn append_entry<W: Write>(builder: &mut Builder<W>, root: &Path, entry: &Entry, out_path: &Path) -> Result<()> {
    let name = entry.path.strip_prefix(root).unwrap_or(&entry.path);
    let mut header = Header::new_gnu();

    match entry.kind {
        Kind::Dir => {
            let meta = fs::symlink_metadata(&entry.path).map_err(read_failed(&entry.path))?;
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, name, io::empty())
                .map_err(write_failed(out_path))
        }
        Kind::Symlink => {
            let meta = fs::symlink_metadata(&entry.path).map_err(read_failed(&entry.path))?;
            let target = fs::read_link(&entry.path).map_err(read_failed(&entry.path))?;
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, name, &target)
                .map_err(write_failed(out_path))
        }
        Kind::File => {
            // held open only while its contents are streamed
            let file = File::open(&entry.path).map_err(read_failed(&entry.path))?;
            let meta = file.metadata().map_err(read_failed(&entry.path))?;
            let size = meta.len();
            header.set_metadata_in_mode(&meta, HeaderMode::Complete);
            header.set_size(size);

            let mut reader = Tracked { inner: file.take(size), read: 0, failed: false };
            if let Err(source) = builder.append_data(&mut header, name, &mut reader) {
                return Err(if reader.failed {
                    BackupError::ArchiveReadFailed { path: entry.path.clone(), source }
                } else {
                    BackupError::ArchiveWriteFailed { path: out_path.to_path_buf(), source }
                });
            }
            if reader.read != size {
                return Err(BackupError::ArchiveReadFailed {
                    path: entry.path.clone(),
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("file shrank while reading: expected {} bytes, read {}", size, reader.read),
                    ),
                });
            }
            Ok(())
        }
    }
}
