//! BLAKE3 file checksums.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Read buffer used while streaming a file through the hasher
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// BLAKE3 checksum of a file's contents
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileChecksum([u8; 32]);

impl FileChecksum {
    /// Wrap raw checksum bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw checksum bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for FileChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileChecksum({})", self.to_hex())
    }
}

/// Checksum of an in-memory buffer
#[must_use]
pub fn hash_bytes(data: &[u8]) -> FileChecksum {
    FileChecksum(*blake3::hash(data).as_bytes())
}

/// Stream a file through BLAKE3
///
/// Blocking; call from `spawn_blocking` inside async code.
pub fn hash_file<P: AsRef<Path>>(path: P) -> io::Result<FileChecksum> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(FileChecksum(*hasher.finalize().as_bytes()))
}
