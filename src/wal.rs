use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

enum Entry {
    Event(Event),
    /// Clean end of file.
    End,
    /// The last record is partial or corrupt: a write that never completed.
    Torn,
}

/// Upper bound on a single encoded record. A larger length prefix can only
/// come from corruption.
const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Read exactly `buf.len()` bytes. `Ok(false)` means EOF was hit first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn at_eof(reader: &mut impl Read) -> io::Result<bool> {
    let mut probe = [0u8; 1];
    Ok(!read_full(reader, &mut probe)?)
}

fn corrupt(reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("corrupt WAL record: {reason}"))
}

/// A complete record that fails its checksum or does not decode is only a
/// torn write when nothing follows it. Anything else is corruption of
/// committed data.
fn bad_record(reader: &mut impl Read, reason: &str) -> io::Result<Entry> {
    if at_eof(reader)? {
        Ok(Entry::Torn)
    } else {
        Err(corrupt(reason))
    }
}

fn read_entry(reader: &mut impl Read) -> io::Result<Entry> {
    let mut len_buf = [0u8; 4];
    let mut first = [0u8; 1];
    if !read_full(reader, &mut first)? {
        return Ok(Entry::End);
    }
    len_buf[0] = first[0];
    if !read_full(reader, &mut len_buf[1..])? {
        return Ok(Entry::Torn);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_BYTES {
        return Err(corrupt("length prefix out of range"));
    }

    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(Entry::Torn);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(Entry::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return bad_record(reader, "checksum mismatch");
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Entry::Event(event)),
        Err(_) => bad_record(reader, "undecodable payload"),
    }
}

/// Result of reading a log back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// A trailing record was incomplete or failed its checksum and was dropped.
    pub torn_tail: bool,
}

/// Append-only Write-Ahead Log of reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded on replay. A bad entry
///   with data after it fails the replay.
///
/// A batch that fails to append or sync is cut back to the last synced
/// length, so no event a caller saw fail can reappear on replay. If that
/// cut itself fails the log refuses every later append.
pub struct Wal {
    /// `None` once the log could not be restored after a failed batch.
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    synced_len: u64,
    unsynced: u64,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_countdown: Option<u64>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path: path.to_path_buf(),
            synced_len,
            unsynced: 0,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_countdown: None,
        })
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("WAL unusable after a failed rollback"))
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Let `after` more appends through, then fail every one. `None` clears it.
    #[cfg(test)]
    pub(crate) fn fail_appends(&mut self, after: Option<u64>) {
        self.fail_countdown = after;
    }

    /// Buffer one event. Nothing is durable until `flush_sync()`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        #[cfg(test)]
        if let Some(left) = self.fail_countdown.as_mut() {
            if *left == 0 {
                return Err(io::Error::other("injected append failure"));
            }
            *left -= 1;
        }
        encode_event(self.writer()?, event)?;
        self.unsynced += 1;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        let len = writer.get_ref().metadata()?.len();
        self.synced_len = len;
        self.unsynced = 0;
        Ok(())
    }

    /// Append `events` and sync them as one unit. On failure none of them
    /// stay in the file.
    pub fn append_batch<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) -> io::Result<()> {
        let result = events
            .into_iter()
            .try_for_each(|event| self.append_buffered(event))
            .and_then(|()| self.flush_sync());
        if result.is_err() {
            self.discard_unsynced();
        }
        result
    }

    fn discard_unsynced(&mut self) {
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.unsynced);
        self.unsynced = 0;
        if let Err(e) = self.truncate_to_synced() {
            tracing::error!(path = %self.path.display(), "WAL rollback failed, refusing further appends: {e}");
        }
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        // Unflushed bytes are dropped with the old buffer, never written.
        if let Some(stale) = self.writer.take() {
            let (_file, _unwritten) = stale.into_parts();
        }
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to a temp file and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));
        self.unsynced = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the file at `path` with exactly `events`. Used after a torn
    /// tail so new appends do not land behind the partial record.
    pub fn rewrite(path: &Path, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(path, events)?;
        fs::rename(path.with_extension("wal.tmp"), path)
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every event back. A missing file is an empty log. A torn last
    /// record is dropped and reported; a bad record anywhere else is an
    /// `InvalidData` error.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();
        loop {
            match read_entry(&mut reader)? {
                Entry::Event(event) => replay.events.push(event),
                Entry::End => break,
                Entry::Torn => {
                    replay.torn_tail = true;
                    break;
                }
            }
        }
        Ok(replay)
    }
}
