//! Durable per-group command log.
//!
//! Records are framed `(u32 len, u32 crc32, payload)` with the payload
//! holding `(u64 index, u32 command_len, command)`. The log keeps its live
//! suffix in memory so the sequencer can re-send entries to members that
//! fell behind; truncation rewrites the file through a temp-and-rename.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher;

use rill_common::codec::{read_u32_be, read_u64_be};
use rill_common::{Error, Result};

pub struct GroupLog {
    inner: Mutex<LogInner>,
}

struct LogInner {
    path: PathBuf,
    file: File,
    /// Contiguous live entries; `floor` is the index before the first one.
    entries: Vec<crate::types::Entry>,
    floor: u64,
}

impl GroupLog {
    /// Open (or create) the log file and load all live entries.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Error::internal(format!("create log dir: {err}")))?;
        }
        let entries = read_entries(&path)?;
        let floor = entries.first().map_or(0, |e| e.index - 1);
        let file = open_for_append(&path)?;
        Ok(Self {
            inner: Mutex::new(LogInner {
                path,
                file,
                entries,
                floor,
            }),
        })
    }

    /// Append entries and flush them to the OS.
    pub fn append(&self, entries: &[crate::types::Entry]) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        for entry in entries {
            let payload = encode_entry(entry);
            write_record(&mut inner.file, &payload)
                .map_err(|err| Error::internal(format!("log append: {err}")))?;
        }
        inner
            .file
            .flush()
            .map_err(|err| Error::internal(format!("log flush: {err}")))?;
        inner.entries.extend_from_slice(entries);
        Ok(())
    }

    pub fn last_index(&self) -> u64 {
        let inner = self.inner.lock().expect("log lock poisoned");
        inner.entries.last().map_or(inner.floor, |e| e.index)
    }

    /// Entries with index >= `from`, if still retained.
    pub fn entries_from(&self, from: u64) -> Option<Vec<crate::types::Entry>> {
        let inner = self.inner.lock().expect("log lock poisoned");
        if from <= inner.floor {
            return None;
        }
        let skip = (from - inner.floor - 1) as usize;
        Some(inner.entries[skip.min(inner.entries.len())..].to_vec())
    }

    /// Drop entries with index <= `below` and rewrite the file.
    pub fn truncate_below(&self, below: u64) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        if below <= inner.floor {
            return Ok(());
        }
        let keep_from = (below - inner.floor) as usize;
        let retained: Vec<_> = inner.entries[keep_from.min(inner.entries.len())..].to_vec();

        let tmp_path = inner.path.with_extension("wal.tmp");
        let mut out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .map_err(|err| Error::internal(format!("open log temp: {err}")))?;
        for entry in &retained {
            write_record(&mut out, &encode_entry(entry))
                .map_err(|err| Error::internal(format!("log rewrite: {err}")))?;
        }
        out.flush()
            .and_then(|_| out.sync_all())
            .map_err(|err| Error::internal(format!("log rewrite sync: {err}")))?;
        fs::rename(&tmp_path, &inner.path)
            .map_err(|err| Error::internal(format!("log rewrite rename: {err}")))?;

        inner.file = open_for_append(&inner.path)?;
        inner.entries = retained;
        inner.floor = below;
        Ok(())
    }

    /// Reset after a snapshot install: everything at or below `index` is
    /// covered by the installed state.
    pub fn reset_to(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        let tmp_path = inner.path.with_extension("wal.tmp");
        let out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .map_err(|err| Error::internal(format!("open log temp: {err}")))?;
        out.sync_all()
            .map_err(|err| Error::internal(format!("log reset sync: {err}")))?;
        fs::rename(&tmp_path, &inner.path)
            .map_err(|err| Error::internal(format!("log reset rename: {err}")))?;
        inner.file = open_for_append(&inner.path)?;
        inner.entries.clear();
        inner.floor = index;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock().expect("log lock poisoned");
        inner
            .file
            .sync_data()
            .map_err(|err| Error::internal(format!("log sync: {err}")))
    }
}

fn open_for_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| Error::internal(format!("open log: {err}")))
}

fn write_record(file: &mut File, payload: &[u8]) -> std::io::Result<()> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    file.write_all(&(payload.len() as u32).to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(payload)
}

fn read_entries(path: &Path) -> Result<Vec<crate::types::Entry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::internal(format!("open log for replay: {err}"))),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(Error::internal(format!("log replay: {err}"))),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader
            .read_exact(&mut crc_buf)
            .map_err(|err| Error::internal(format!("log replay: {err}")))?;
        let expected = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .map_err(|err| Error::internal(format!("log replay: {err}")))?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected {
            return Err(Error::corrupt("log record checksum mismatch"));
        }
        entries.push(decode_entry(&payload)?);
    }
    Ok(entries)
}

fn encode_entry(entry: &crate::types::Entry) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 4 + entry.command.len());
    out.extend_from_slice(&entry.index.to_be_bytes());
    out.extend_from_slice(&(entry.command.len() as u32).to_be_bytes());
    out.extend_from_slice(&entry.command);
    out
}

fn decode_entry(payload: &[u8]) -> Result<crate::types::Entry> {
    let mut offset = 0usize;
    let index = read_u64_be(payload, &mut offset)?;
    let len = read_u32_be(payload, &mut offset)? as usize;
    if offset + len > payload.len() {
        return Err(Error::corrupt("log record short command"));
    }
    let command = payload[offset..offset + len].to_vec();
    Ok(crate::types::Entry { index, command })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Entry;

    fn entry(index: u64, byte: u8) -> Entry {
        Entry {
            index,
            command: vec![byte; 3],
        }
    }

    #[test]
    fn append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group-1.wal");
        {
            let log = GroupLog::open(&path).unwrap();
            log.append(&[entry(1, 0xAA), entry(2, 0xBB)]).unwrap();
            assert_eq!(log.last_index(), 2);
        }
        let reopened = GroupLog::open(&path).unwrap();
        assert_eq!(reopened.last_index(), 2);
        let entries = reopened.entries_from(1).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].command, vec![0xBB; 3]);
    }

    #[test]
    fn truncate_drops_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group-2.wal");
        let log = GroupLog::open(&path).unwrap();
        log.append(&[entry(1, 1), entry(2, 2), entry(3, 3)]).unwrap();
        log.truncate_below(2).unwrap();
        assert!(log.entries_from(2).is_none());
        let tail = log.entries_from(3).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].index, 3);

        let reopened = GroupLog::open(&path).unwrap();
        assert_eq!(reopened.last_index(), 3);
    }

    #[test]
    fn reset_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group-3.wal");
        let log = GroupLog::open(&path).unwrap();
        log.append(&[entry(1, 1)]).unwrap();
        log.reset_to(10).unwrap();
        assert_eq!(log.last_index(), 10);
        log.append(&[entry(11, 4)]).unwrap();
        assert_eq!(log.entries_from(11).unwrap().len(), 1);
    }
}
