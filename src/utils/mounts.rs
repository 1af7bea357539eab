use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

pub const PROC_MOUNTS: &str = "/proc/mounts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: String,
}

/// Parse a mount table in `/proc/mounts` format, in file order.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next().unwrap_or_default();
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                device: PathBuf::from(unescape(device)),
                mount_point: PathBuf::from(unescape(mount_point)),
                fs_type: fs_type.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

pub fn read_mounts(path: &Path) -> io::Result<Vec<MountEntry>> {
    Ok(parse_mounts(&fs::read_to_string(path)?))
}

/// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let code = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(code) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount point of the filesystem `path` lives on.
///
/// Walks up from the canonical path until the parent sits on another
/// device, or the root is reached.
pub fn mount_point_of(path: &Path) -> io::Result<PathBuf> {
    let mut current = fs::canonicalize(path)?;
    let mut dev = fs::metadata(&current)?.dev();
    loop {
        let Some(parent) = current.parent() else {
            return Ok(current);
        };
        let parent_dev = fs::metadata(parent)?.dev();
        if parent_dev != dev {
            return Ok(current);
        }
        dev = parent_dev;
        current = parent.to_path_buf();
    }
}

/// Most recent mount table entry for a mount point.
pub fn entry_for_mount_point<'a>(entries: &'a [MountEntry], mount_point: &Path) -> Option<&'a MountEntry> {
    entries.iter().rev().find(|e| e.mount_point == mount_point)
}

/// Every place `device` is mounted, most recent first.
///
/// Devices are compared by canonical path so `/dev/vg/lv` and
/// `/dev/mapper/vg-lv` match.
pub fn mount_points_of_device(entries: &[MountEntry], device: &Path) -> Vec<PathBuf> {
    let wanted = canonical_or_self(device);
    entries
        .iter()
        .rev()
        .filter(|e| canonical_or_self(&e.device) == wanted)
        .map(|e| e.mount_point.clone())
        .collect()
}

/// Canonical form of `path`, or `path` itself when it cannot be resolved.
pub fn canonical_or_self(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Re-root `path` from `mount_point` onto `new_base`.
///
/// `/var/lib/mysql` on mount point `/var/lib` remapped onto `/mnt/snap`
/// is `/mnt/snap/mysql`.
pub fn remap(path: &Path, mount_point: &Path, new_base: &Path) -> PathBuf {
    match path.strip_prefix(mount_point) {
        Ok(rel) if rel.as_os_str().is_empty() => new_base.to_path_buf(),
        Ok(rel) => new_base.join(rel),
        Err(_) => new_base.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/mapper/vg0-root / ext4 rw,relatime 0 0
/dev/mapper/vg0-mysql /var/lib/mysql xfs rw,relatime,attr2 0 0
/dev/mapper/vg0-mysql_snapshot /tmp/snap\\040dir/mysql_snapshot xfs ro,nouuid 0 0
/dev/sdb1 /var/lib/mysql ext4 rw 0 0
";

    #[test]
    fn test_parse_mounts_unescapes() {
        let entries = parse_mounts(SAMPLE);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[3].mount_point, PathBuf::from("/tmp/snap dir/mysql_snapshot"));
        assert_eq!(entries[2].fs_type, "xfs");
        assert_eq!(entries[3].options, "ro,nouuid");
    }

    #[test]
    fn test_entry_for_mount_point_prefers_latest() {
        let entries = parse_mounts(SAMPLE);
        let entry = entry_for_mount_point(&entries, Path::new("/var/lib/mysql")).unwrap();
        assert_eq!(entry.device, PathBuf::from("/dev/sdb1"));
        assert!(entry_for_mount_point(&entries, Path::new("/srv")).is_none());
    }

    #[test]
    fn test_mount_points_of_device() {
        let entries = parse_mounts(SAMPLE);
        let points = mount_points_of_device(&entries, Path::new("/dev/mapper/vg0-mysql_snapshot"));
        assert_eq!(points, vec![PathBuf::from("/tmp/snap dir/mysql_snapshot")]);
        assert!(mount_points_of_device(&entries, Path::new("/dev/vg9/none")).is_empty());
    }

    #[test]
    fn test_mount_point_of_is_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        let mp = mount_point_of(&nested).unwrap();
        assert!(fs::canonicalize(&nested).unwrap().starts_with(&mp));
    }

    #[test]
    fn test_remap() {
        let out = remap(Path::new("/var/lib/mysql"), Path::new("/var/lib"), Path::new("/mnt/snap"));
        assert_eq!(out, PathBuf::from("/mnt/snap/mysql"));
        let same = remap(Path::new("/var/lib/mysql"), Path::new("/var/lib/mysql"), Path::new("/mnt/snap"));
        assert_eq!(same, PathBuf::from("/mnt/snap"));
    }
}
