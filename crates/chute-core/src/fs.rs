//! Durable file helpers shared by the store, host config and OS config writers.
//!
//! Writes are atomic: write to a temp file next to the target, fsync, rename.
//! A reader never observes a half-written file.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Atomically replace `path` with `data`, creating parent directories.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp_path);
    })
}

/// Read a file that may legitimately not exist yet.
pub fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Put a file back the way a snapshot saw it; `None` means it did not exist.
pub fn restore(path: &Path, snapshot: Option<&str>) -> io::Result<()> {
    match snapshot {
        Some(text) => write_atomic(path, text.as_bytes()),
        None => match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir() -> std::path::PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("chute-fs-test-{}-{}", std::process::id(), id));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn write_creates_parents_and_leaves_no_temp() {
        let dir = temp_dir();
        let path = dir.join("a").join("b.yaml");

        write_atomic(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        assert!(!dir.join("a").join("b.yaml.tmp").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn read_optional_missing_is_none() {
        let dir = temp_dir();
        assert_eq!(read_optional(&dir.join("nope")).unwrap(), None);
    }

    #[test]
    fn restore_none_removes_file() {
        let dir = temp_dir();
        let path = dir.join("f");
        write_atomic(&path, b"x").unwrap();

        restore(&path, None).unwrap();
        assert!(!path.exists());
        restore(&path, None).unwrap();

        restore(&path, Some("back")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "back");

        let _ = fs::remove_dir_all(&dir);
    }
}
