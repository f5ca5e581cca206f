//! The `index` marker file that claims a cache directory.
//!
//! Layout (20 bytes): little-endian `u64` magic, little-endian `u32`
//! version, 8 bytes of zero padding.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use crate::Error;

pub const MARKER_FILE_NAME: &str = "index";
pub const MARKER_MAGIC: u64 = 0x6568_6361_636c_7173;
pub const MARKER_VERSION: u32 = 1;
pub const MARKER_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    Created,
    Existing,
}

pub fn encode() -> BytesMut {
    let mut buf = BytesMut::with_capacity(MARKER_SIZE);
    buf.put_u64_le(MARKER_MAGIC);
    buf.put_u32_le(MARKER_VERSION);
    buf.put_bytes(0, MARKER_SIZE - buf.len());
    buf
}

/// The marker version, or `None` if `data` is not a marker.
pub fn decode(mut data: &[u8]) -> Option<u32> {
    if data.len() != MARKER_SIZE {
        return None;
    }
    if data.get_u64_le() != MARKER_MAGIC {
        return None;
    }
    Some(data.get_u32_le())
}

/// Write the marker into `dir`, or verify the one already there.
pub fn claim(dir: &Path) -> Result<MarkerState, Error> {
    let path = dir.join(MARKER_FILE_NAME);
    match fs::read(&path) {
        Ok(data) => match decode(&data) {
            Some(MARKER_VERSION) => Ok(MarkerState::Existing),
            Some(version) => {
                Err(Error::FailedToOpenDatabase(format!("unsupported marker version {version} in {}", path.display())))
            }
            None => Err(Error::FailedToOpenDatabase(format!("{} is not a cache marker", path.display()))),
        },
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::write(&path, encode()).map_err(|e| Error::FailedToCreateDirectory(format!("{}: {e}", path.display())))?;
            Ok(MarkerState::Created)
        }
        Err(e) => Err(Error::FailedToOpenDatabase(format!("{}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_encoded_layout() {
        let data = encode();
        assert_eq!(data.len(), MARKER_SIZE);
        assert_eq!(&data[..8], b"sqlcache");
        assert_eq!(&data[8..12], &[1, 0, 0, 0]);
        assert!(data[12..].iter().all(|b| *b == 0));
        assert_eq!(decode(&data), Some(MARKER_VERSION));
    }

    #[test]
    fn test_decode_rejects_foreign_data() {
        assert_eq!(decode(b"short"), None);
        assert_eq!(decode(&[0u8; MARKER_SIZE]), None);
    }

    #[test]
    fn test_claim_creates_then_recognizes() {
        let dir = TempDir::new().unwrap();
        assert_eq!(claim(dir.path()).unwrap(), MarkerState::Created);
        assert_eq!(claim(dir.path()).unwrap(), MarkerState::Existing);
    }

    #[test]
    fn test_claim_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MARKER_FILE_NAME), b"not ours").unwrap();
        assert!(matches!(claim(dir.path()), Err(Error::FailedToOpenDatabase(_))));
    }
}
