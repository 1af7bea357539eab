use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Build a matcher for gitignore-style exclude patterns rooted at `root`.
pub fn build_excluder(root: &Path, patterns: &[String]) -> Result<Gitignore, ignore::Error> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        builder.add_line(None, pattern)?;
    }
    builder.build()
}

pub fn is_excluded(excluder: &Gitignore, path: &Path, is_dir: bool) -> bool {
    excluder.matched(path, is_dir).is_ignore()
}

/// Every entry below `root` (not `root` itself), sorted by name, skipping
/// excluded paths and anything beneath them. Traversal errors are returned
/// in line with the path they concern.
pub fn walk_excluding<'a>(
    root: &Path,
    excluder: &'a Gitignore,
) -> impl Iterator<Item = Result<walkdir::DirEntry, (PathBuf, io::Error)>> + 'a {
    let fallback = root.to_path_buf();
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |e| !is_excluded(excluder, e.path(), e.file_type().is_dir()))
        .map(move |entry| {
            entry.map_err(|err| {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| fallback.clone());
                (path, io::Error::from(err))
            })
        })
}

/// Top-level directories and non-directories of `dir`, sorted by name.
/// Symlinks count as non-directories; they are archived as links.
pub fn top_level_entries(dir: &Path, excluder: &Gitignore) -> io::Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut dirs = Vec::new();
    let mut others = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_dir = entry.file_type()?.is_dir();
        if is_excluded(excluder, &path, is_dir) {
            continue;
        }
        if is_dir { dirs.push(path); } else { others.push(path); }
    }
    dirs.sort();
    others.sort();
    Ok((dirs, others))
}

/// Total size of the regular files below `root`, skipping excluded paths.
/// Files that vanish during the walk are not counted.
pub fn directory_size(root: &Path, excluder: &Gitignore) -> Result<u64, (PathBuf, io::Error)> {
    let mut total = 0u64;
    for entry in walk_excluding(root, excluder) {
        let entry = match entry {
            Ok(entry) => entry,
            Err((_, e)) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.metadata() {
            Ok(meta) => total = total.saturating_add(meta.len()),
            Err(err) => {
                let err = io::Error::from(err);
                if err.kind() != io::ErrorKind::NotFound {
                    return Err((entry.into_path(), err));
                }
            }
        }
    }
    Ok(total)
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

pub fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("lost+found")).unwrap();
        fs::write(root.join("a/t1.ibd"), b"one").unwrap();
        fs::write(root.join("a/t1.frm"), b"frm").unwrap();
        fs::write(root.join("ibdata1"), b"shared").unwrap();
        fs::write(root.join("lost+found/x"), b"junk").unwrap();
        dir
    }

    #[test]
    fn test_walk_excluding_skips_patterns() {
        let dir = fixture();
        let excluder = build_excluder(dir.path(), &["lost+found".to_string()]).unwrap();
        let names: Vec<String> = walk_excluding(dir.path(), &excluder)
            .map(|e| e.unwrap().path().strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["a", "a/t1.frm", "a/t1.ibd", "ibdata1"]);
    }

    #[test]
    fn test_top_level_entries() {
        let dir = fixture();
        let excluder = build_excluder(dir.path(), &["lost+found".to_string(), "*.pid".to_string()]).unwrap();
        fs::write(dir.path().join("mysqld.pid"), b"42").unwrap();
        let (dirs, others) = top_level_entries(dir.path(), &excluder).unwrap();
        assert_eq!(dirs, vec![dir.path().join("a")]);
        assert_eq!(others, vec![dir.path().join("ibdata1")]);
    }

    #[test]
    fn test_directory_size_counts_files_only() {
        let dir = fixture();
        let excluder = build_excluder(dir.path(), &["lost+found".to_string()]).unwrap();
        // one + frm + shared; lost+found/x is excluded
        assert_eq!(directory_size(dir.path(), &excluder).unwrap(), 3 + 3 + 6);
    }

    #[test]
    fn test_clear_dir_keeps_the_directory() {
        let dir = fixture();
        clear_dir(dir.path()).unwrap();
        assert!(dir.path().is_dir());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_dir_if_exists_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        remove_dir_if_exists(&dir.path().join("missing")).unwrap();
        let sub = dir.path().join("out");
        fs::create_dir_all(sub.join("x")).unwrap();
        remove_dir_if_exists(&sub).unwrap();
        assert!(!sub.exists());
    }
}
