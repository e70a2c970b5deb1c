use std::io::ErrorKind;
use std::path::Path;
use std::{fs, io};

/// Identical to `fs::remove_file()` except `NotFound` errors are ignored
pub fn remove_file_ignore_not_found(path: impl AsRef<Path>) -> io::Result<()> {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            return Err(e);
        }
    }
    Ok(())
}

/// Removes the directory if it contains no entries. Failures are ignored;
/// an empty fan-out directory is harmless.
pub fn remove_dir_if_empty(dir: impl AsRef<Path>) {
    let dir = dir.as_ref();
    if let Ok(mut entries) = fs::read_dir(dir) {
        if entries.next().is_none() {
            let _ = fs::remove_dir(dir);
        }
    }
}
