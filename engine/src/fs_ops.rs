//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Creating destination folders and parent directories
//! - Opening destinations for a fresh or resumed write
//! - Preserving timestamps and permissions after the data is written
//! - Same-filesystem moves and removal of emptied source folders

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;

use filetime::FileTime;

use crate::error::TransferError;

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Arguments
/// * `path` - Path for which the parent directory should be created
///
/// # Errors
/// Returns `TransferError::CreateDirectory` if directory creation fails or
/// the parent exists and is not a directory.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), TransferError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(TransferError::CreateDirectory {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|source| TransferError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(TransferError::CreateDirectory {
            path: parent.to_path_buf(),
            source,
        }),
    }
}

/// Create a destination folder. An existing directory is accepted (merge).
pub fn create_folder(path: &Path) -> Result<(), TransferError> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(source) => Err(TransferError::CreateDirectory {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Remove an emptied source folder after a move.
///
/// # Returns
/// `Ok(false)` if the folder still has entries (something under it was
/// skipped or filtered out) and was left in place.
pub fn remove_empty_folder(path: &Path) -> Result<bool, TransferError> {
    let mut entries = fs::read_dir(path).map_err(|source| TransferError::RemoveSource {
        path: path.to_path_buf(),
        source,
    })?;
    if entries.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(path).map_err(|source| TransferError::RemoveSource {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(true)
}

/// Open a destination for writing.
///
/// With `offset == 0` the file is created or truncated. Otherwise the
/// existing file is cut back to `offset` and the cursor placed there, so a
/// resumed transfer continues from the last committed block.
pub fn open_destination(path: &Path, offset: u64) -> Result<File, TransferError> {
    if offset == 0 {
        return File::create(path).map_err(|e| TransferError::write(path, e));
    }
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| TransferError::write(path, e))?;
    file.set_len(offset).map_err(|e| TransferError::write(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| TransferError::write(path, e))?;
    Ok(file)
}

/// Length of an existing destination, 0 if it does not exist.
pub fn existing_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Copy timestamps and/or permission bits from `source` to `destination`.
///
/// Called only once the destination data is complete.
pub fn preserve_metadata(
    source: &fs::Metadata,
    destination: &Path,
    timestamps: bool,
    permissions: bool,
) -> Result<(), TransferError> {
    if timestamps {
        let atime = FileTime::from_last_access_time(source);
        let mtime = FileTime::from_last_modification_time(source);
        filetime::set_file_times(destination, atime, mtime).map_err(|source| {
            TransferError::Metadata {
                path: destination.to_path_buf(),
                source,
            }
        })?;
    }
    if permissions {
        fs::set_permissions(destination, source.permissions()).map_err(|source| {
            TransferError::Metadata {
                path: destination.to_path_buf(),
                source,
            }
        })?;
    }
    Ok(())
}

/// Try a same-filesystem rename. Returns false when the caller has to fall
/// back to copy then delete (different device, or any other refusal).
pub fn try_rename(source: &Path, destination: &Path) -> bool {
    if ensure_parent_dir_exists(destination).is_err() {
        return false;
    }
    match fs::rename(source, destination) {
        Ok(()) => true,
        Err(e) => {
            log::debug!(
                "rename {} -> {} refused ({}), copying instead",
                source.display(),
                destination.display(),
                e
            );
            false
        }
    }
}

/// Remove the source file of a completed move.
pub fn remove_source_file(path: &Path) -> Result<(), TransferError> {
    fs::remove_file(path).map_err(|source| TransferError::RemoveSource {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_ensure_parent_dir_exists() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("subdir").join("file.txt");

        ensure_parent_dir_exists(&path).expect("Failed to create parent");
        assert!(temp_dir.path().join("subdir").is_dir());
    }

    #[test]
    fn test_ensure_parent_dir_rejects_file_in_the_way() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("blocker"), b"x").expect("write");
        let result = ensure_parent_dir_exists(&temp_dir.path().join("blocker").join("file.txt"));
        assert!(matches!(result, Err(TransferError::CreateDirectory { .. })));
    }

    #[test]
    fn test_open_destination_resumes_at_offset() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("partial.bin");
        fs::write(&path, b"0123456789").expect("write");

        let mut file = open_destination(&path, 4).expect("open at offset");
        file.write_all(b"abcd").expect("write tail");
        drop(file);

        assert_eq!(fs::read(&path).expect("read"), b"0123abcd");
        assert_eq!(existing_len(&path), 8);
    }

    #[test]
    fn test_remove_empty_folder_leaves_non_empty_ones() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let full = temp_dir.path().join("full");
        let empty = temp_dir.path().join("empty");
        fs::create_dir(&full).expect("mkdir");
        fs::create_dir(&empty).expect("mkdir");
        fs::write(full.join("keep"), b"x").expect("write");

        assert!(!remove_empty_folder(&full).expect("inspect"));
        assert!(full.exists());
        assert!(remove_empty_folder(&empty).expect("remove"));
        assert!(!empty.exists());
    }

    #[test]
    fn test_preserve_timestamps() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src.txt");
        let dst = temp_dir.path().join("dst.txt");
        fs::write(&src, b"data").expect("write");
        fs::write(&dst, b"data").expect("write");
        let old = SystemTime::now() - Duration::from_secs(3600);
        filetime::set_file_mtime(&src, FileTime::from_system_time(old)).expect("set mtime");

        let metadata = fs::metadata(&src).expect("stat");
        preserve_metadata(&metadata, &dst, true, true).expect("preserve");

        let copied = FileTime::from_last_modification_time(&fs::metadata(&dst).expect("stat"));
        assert_eq!(copied.unix_seconds(), FileTime::from_system_time(old).unix_seconds());
    }

    #[test]
    fn test_try_rename_creates_parent() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        fs::write(&src, b"data").expect("write");
        let dst = temp_dir.path().join("nested/b.txt");

        assert!(try_rename(&src, &dst));
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).expect("read"), b"data");
    }
}
