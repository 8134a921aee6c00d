//! Append-only, checksummed record file.
//!
//! Each record is a single line:
//!
//! ```text
//! <payload len, 8 hex> <SHA-256 prefix of payload, 16 hex> <JSON payload>\n
//! ```
//!
//! A frame is written with one `write_all` call. A crash can therefore only
//! leave a torn frame at the very end of the file; [`RecordLog::open`]
//! detects it (missing newline, length mismatch or checksum mismatch) and
//! truncates the file back to the last complete frame. A write that fails
//! part-way is cut off the same way before the next append; if that cut
//! fails too, the log refuses further appends until it is reopened.

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use crate::error::AppResult;

const HEADER_LEN: usize = 8 + 1 + 16 + 1;

/// What [`RecordLog::open`] found on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Recovery {
    /// Complete frames kept
    pub valid_records: u64,
    /// Bytes of torn or corrupt tail that were cut off
    pub discarded_bytes: u64,
}

/// Append-only file of `T` records.
#[derive(Debug)]
pub struct RecordLog<T> {
    path: PathBuf,
    file: File,
    sync: bool,
    records: u64,
    /// Byte length of the complete frames
    valid_len: u64,
    /// A partial frame could not be removed
    poisoned: bool,
    _marker: PhantomData<fn(T)>,
}

impl<T> RecordLog<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open (or create) the log at `path`, discarding any torn tail.
    ///
    /// With `sync` set, every append is followed by `fsync`.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> AppResult<(Self, Recovery)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let file_len = file.metadata()?.len();
        let (valid_records, valid_len) = scan(&path)?;

        let mut recovery = Recovery {
            valid_records,
            discarded_bytes: 0,
        };
        if valid_len < file_len {
            recovery.discarded_bytes = file_len - valid_len;
            warn!(
                path = %path.display(),
                discarded_bytes = recovery.discarded_bytes,
                "Discarding torn tail of record log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok((
            Self {
                path,
                file,
                sync,
                records: valid_records,
                valid_len,
                poisoned: false,
                _marker: PhantomData,
            },
            recovery,
        ))
    }

    /// Append one record. This is the only mutation a record log supports.
    pub fn append(&mut self, record: &T) -> AppResult<()> {
        let payload = serde_json::to_vec(record)?;
        let frame = encode_frame(&payload);
        self.append_frame(&frame, |file, frame| file.write_all(frame))
    }

    fn append_frame(
        &mut self,
        frame: &[u8],
        write: impl FnOnce(&mut File, &[u8]) -> io::Result<()>,
    ) -> AppResult<()> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} holds an unremovable partial frame", self.path.display()),
            )
            .into());
        }
        if let Err(err) = write(&mut self.file, frame) {
            self.discard_partial();
            return Err(err.into());
        }
        self.valid_len += frame.len() as u64;
        self.records += 1;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Cut the file back to its last complete frame after a failed write.
    fn discard_partial(&mut self) {
        if let Err(err) = self.file.set_len(self.valid_len) {
            error!(
                path = %self.path.display(),
                %err,
                "Cannot remove partial frame; refusing further appends"
            );
            self.poisoned = true;
        }
    }

    /// Force written records to stable storage.
    pub fn flush(&mut self) -> AppResult<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Number of records in the file.
    pub fn len(&self) -> u64 {
        self.records
    }

    /// True if the file holds no records.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Location of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every complete record of the log at `path`, in append order.
///
/// A torn tail is ignored; a missing file replays as empty.
pub fn replay<T: DeserializeOwned>(path: impl AsRef<Path>) -> AppResult<Vec<T>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        let Some(payload) = decode_frame(&line) else {
            break;
        };
        match serde_json::from_slice(payload) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(path = %path.display(), %err, "Stopping replay at undecodable record");
                break;
            }
        }
    }
    Ok(records)
}

/// Returns (complete frames, byte length of the valid prefix).
fn scan(path: &Path) -> AppResult<(u64, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    let mut count = 0;
    let mut valid_len = 0u64;
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 || decode_frame(&line).is_none() {
            break;
        }
        count += 1;
        valid_len += read as u64;
    }
    Ok((count, valid_len))
}

fn checksum(payload: &[u8]) -> u64 {
    let digest = Sha256::digest(payload);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 1);
    frame.extend_from_slice(
        format!("{:08x} {:016x} ", payload.len(), checksum(payload)).as_bytes(),
    );
    frame.extend_from_slice(payload);
    frame.push(b'\n');
    frame
}

/// Validate one line (including its trailing newline) and return the payload.
fn decode_frame(line: &[u8]) -> Option<&[u8]> {
    let body = line.strip_suffix(b"\n")?;
    if body.len() < HEADER_LEN {
        return None;
    }
    let (header, payload) = body.split_at(HEADER_LEN);
    let header = std::str::from_utf8(header).ok()?;
    let len = usize::from_str_radix(header.get(0..8)?, 16).ok()?;
    let sum = u64::from_str_radix(header.get(9..25)?, 16).ok()?;
    if payload.len() != len || checksum(payload) != sum {
        return None;
    }
    Some(payload)
}
