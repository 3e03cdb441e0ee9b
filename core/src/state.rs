//! Durable per-consumer cursors.
//!
//! A consumer that must survive restarts records the arrival timestamp of
//! the last product it fully processed. The state file is two big-endian
//! 64-bit fields (seconds, microseconds) and is replaced atomically via a
//! sibling temp file and rename, so a crash mid-write leaves the previous
//! cursor intact.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::product::Timestamp;

const STATE_LEN: usize = 16;

/// Handle on a consumer's cursor state file.
#[derive(Clone, Debug)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: &Path) -> CursorFile {
        CursorFile {
            path: path.to_path_buf(),
        }
    }

    /// The conventional state path for a configuration file: `<conf>.state`.
    pub fn for_config(conf: &Path) -> CursorFile {
        let mut name = conf.as_os_str().to_os_string();
        name.push(".state");
        CursorFile {
            path: PathBuf::from(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the saved cursor. `None` when no state has been written yet;
    /// a short or unreadable file is treated the same way (and logged),
    /// since resuming from the tail beats refusing to start.
    pub fn load(&self) -> Option<Timestamp> {
        let mut buf = [0u8; STATE_LEN];
        match fs::File::open(&self.path) {
            Ok(mut file) => match file.read_exact(&mut buf) {
                Ok(()) => Some(Timestamp::new(
                    BigEndian::read_u64(&buf[0..]),
                    BigEndian::read_u64(&buf[8..]) as u32,
                )),
                Err(err) => {
                    log::error!(
                        "unreadable cursor state {}: {}",
                        self.path.display(),
                        err
                    );
                    None
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                log::error!("cannot open cursor state {}: {}", self.path.display(), err);
                None
            }
        }
    }

    /// Atomically replaces the saved cursor.
    pub fn store(&self, ts: Timestamp) -> io::Result<()> {
        let mut buf = [0u8; STATE_LEN];
        BigEndian::write_u64(&mut buf[0..], ts.sec);
        BigEndian::write_u64(&mut buf[8..], ts.usec as u64);

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorFile::new(&dir.path().join("absent.state"));
        assert_eq!(cursor.load(), None);
    }

    #[test]
    fn state_store_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = CursorFile::new(&dir.path().join("pqact.state"));
        let ts = Timestamp::new(1_700_000_000, 123_456);
        cursor.store(ts).unwrap();
        assert_eq!(cursor.load(), Some(ts));

        // Overwrite is atomic and complete.
        let later = Timestamp::new(1_700_000_100, 1);
        cursor.store(later).unwrap();
        assert_eq!(cursor.load(), Some(later));
    }

    #[test]
    fn state_short_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.state");
        fs::write(&path, [0u8; 7]).unwrap();
        assert_eq!(CursorFile::new(&path).load(), None);
    }

    #[test]
    fn state_for_config_appends_suffix() {
        let cursor = CursorFile::for_config(Path::new("/etc/stratus/pqact.conf"));
        assert_eq!(
            cursor.path(),
            Path::new("/etc/stratus/pqact.conf.state")
        );
    }
}
