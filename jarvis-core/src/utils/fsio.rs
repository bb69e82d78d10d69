use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sibling temp path: `<name>.tmp` next to `path` (never replaces the extension).
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to a temp sibling and rename it over `path`.
///
/// On failure the temp file is removed and `path` is left as it was.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    let res = (|| {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.flush()?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, path)
    })();
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_sibling_appends_suffix() {
        assert_eq!(temp_sibling(Path::new("/w/a.py")), PathBuf::from("/w/a.py.tmp"));
    }

    #[test]
    fn atomic_write_replaces_content_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("nested").join("f.txt");
        write_atomic(&p, b"one").unwrap();
        write_atomic(&p, b"two").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"two");
        assert!(!temp_sibling(&p).exists());
    }

    #[test]
    fn failed_write_leaves_target_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("f.txt");
        fs::write(&p, b"keep").unwrap();
        fs::create_dir_all(temp_sibling(&p)).unwrap();
        assert!(write_atomic(&p, b"lost").is_err());
        assert_eq!(fs::read(&p).unwrap(), b"keep");
    }
}
