use std::fs;
use std::path::PathBuf;

/// Platform junk that never belongs in an advertised file list. Dot-files
/// are filtered separately.
const JUNK_FILES: &[&str] = &["Thumbs.db", "desktop.ini"];

/// Where the files offered to other peers live. The catalog is derived
/// from this directory on every request, never cached.
pub trait ShareFolder: Send + Sync {
    fn dir(&self) -> PathBuf;
}

pub struct FixedShareFolder {
    dir: PathBuf,
}

impl FixedShareFolder {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl ShareFolder for FixedShareFolder {
    fn dir(&self) -> PathBuf {
        self.dir.clone()
    }
}

/// Advertised file names: regular files in the top level of the shared
/// folder, minus hidden files and platform junk. Sorted so repeated calls
/// compare equal.
pub fn list_files(share: &dyn ShareFolder) -> Vec<String> {
    let mut names = Vec::new();
    let entries = match fs::read_dir(share.dir()) {
        Ok(entries) => entries,
        Err(_) => return names,
    };
    for entry in entries.flatten() {
        if !entry.path().is_file() {
            continue;
        }
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name.starts_with('.') || JUNK_FILES.contains(&name.as_str()) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    names
}

/// Reject names that could escape the shared folder.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && name != ".." && name != "."
}

#[cfg(test)]
mod unit_tests {
    use std::fs::File;
    use std::io::Write;

    use super::*;

    fn folder_with(files: &[&str]) -> (tempfile::TempDir, FixedShareFolder) {
        let dir = tempfile::tempdir().unwrap();
        for name in files {
            let mut f = File::create(dir.path().join(name)).unwrap();
            f.write_all(b"data").unwrap();
        }
        let share = FixedShareFolder::new(dir.path().to_path_buf());
        (dir, share)
    }

    #[test]
    fn test_lists_regular_files_sorted() {
        let (_dir, share) = folder_with(&["b.txt", "a.txt", "c.bin"]);
        assert_eq!(list_files(&share), ["a.txt", "b.txt", "c.bin"]);
    }

    #[test]
    fn test_hides_dot_files_and_junk() {
        let (_dir, share) = folder_with(&[".hidden", ".DS_Store", "Thumbs.db", "desktop.ini", "kept.txt"]);
        assert_eq!(list_files(&share), ["kept.txt"]);
    }

    #[test]
    fn test_skips_subdirectories() {
        let (dir, share) = folder_with(&["top.txt"]);
        fs::create_dir(dir.path().join("nested")).unwrap();
        File::create(dir.path().join("nested").join("deep.txt")).unwrap();
        assert_eq!(list_files(&share), ["top.txt"]);
    }

    #[test]
    fn test_missing_folder_is_empty() {
        let share = FixedShareFolder::new(PathBuf::from("/definitely/not/here"));
        assert!(list_files(&share).is_empty());
    }

    #[test]
    fn test_reflects_changes_without_restart() {
        let (dir, share) = folder_with(&["first.txt"]);
        assert_eq!(list_files(&share), ["first.txt"]);
        File::create(dir.path().join("second.txt")).unwrap();
        assert_eq!(list_files(&share), ["first.txt", "second.txt"]);
    }

    #[test]
    fn test_is_plain_name() {
        assert!(is_plain_name("movie.mkv"));
        assert!(is_plain_name("with space.txt"));
        assert!(!is_plain_name(""));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("../etc/passwd"));
        assert!(!is_plain_name("a\\b"));
    }
}
