use std::{
    fs::{self, File},
    io::{self, BufReader, Read},
    path::Path,
};

use sha2::{Digest, Sha256};
use sysinfo::Disks;

pub fn compute_sha256(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let hash = hasher.finalize();
    Ok(format!("{:x}", hash))
}

/// Length of a regular file, `None` when it is missing or not a file.
pub(crate) fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

pub(crate) fn is_non_empty_file(path: &Path) -> bool {
    file_len(path).map_or(false, |len| len > 0)
}

/// Free bytes on the volume holding `dir`, picked by longest mount point prefix.
pub(crate) fn available_space(dir: &Path) -> Option<u64> {
    let target = dir.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset.bin");
        fs::write(&path, b"abc").unwrap();

        assert_eq!(
            compute_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_len_ignores_directories_and_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asset.bin");

        assert_eq!(file_len(&path), None);
        assert_eq!(file_len(dir.path()), None);

        fs::write(&path, b"").unwrap();
        assert_eq!(file_len(&path), Some(0));
        assert!(!is_non_empty_file(&path));

        fs::write(&path, b"weights").unwrap();
        assert!(is_non_empty_file(&path));
    }
}
