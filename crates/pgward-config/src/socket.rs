//! Derivation of the engine's Unix socket directory.
//!
//! The built-in engine may default to a socket directory the host lacks
//! permissions for, so the supervisor always passes its own. When none is
//! configured the directory is derived from a digest of the data-directory
//! path: repeated runs against the same data directory reuse the same
//! socket path, and distinct data directories never collide.

use std::env;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Number of digest bytes folded into the directory name.
const DIGEST_BYTES: usize = 8;

/// Computes the deterministic socket directory for a data directory.
#[must_use]
pub fn derived_socket_directory(data_directory: &Path) -> PathBuf {
    let digest = Sha256::digest(data_directory.as_os_str().as_encoded_bytes());
    let tag: String = digest
        .iter()
        .take(DIGEST_BYTES)
        .map(|byte| format!("{byte:02x}"))
        .collect();
    env::temp_dir().join(format!("pgward_{tag}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let first = derived_socket_directory(Path::new("/var/db/store"));
        let second = derived_socket_directory(Path::new("/var/db/store"));
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_data_directories_get_distinct_sockets() {
        let first = derived_socket_directory(Path::new("/var/db/a"));
        let second = derived_socket_directory(Path::new("/var/db/b"));
        assert_ne!(first, second);
    }

    #[test]
    fn directory_lives_under_the_temp_root() {
        let derived = derived_socket_directory(Path::new("/var/db/store"));
        assert!(derived.starts_with(env::temp_dir()));
        let name = derived.file_name().and_then(|name| name.to_str()).unwrap();
        assert!(name.starts_with("pgward_"));
    }
}
