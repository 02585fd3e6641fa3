use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes can only come from a damaged tail.
const MAX_RECORD_LEN: usize = 1 << 20;

/// Length prefix plus checksum around every payload.
const RECORD_OVERHEAD: u64 = 8;

/// Append-only write-ahead log of ledger events.
///
/// Record layout: `[u32 le: len][bincode: Event][u32 le: crc32 of payload]`.
/// A torn or corrupt tail (crash mid-write) ends replay; everything before it is kept.
///
/// The file never holds bytes past the last successful `flush_sync` once a
/// failed flush has been rolled back. If rollback itself fails the log is
/// poisoned and refuses every later append.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful fsync.
    committed_len: u64,
    /// Bytes buffered or written since then.
    pending_len: u64,
    poisoned: bool,
    #[cfg(test)]
    sync_fault: bool,
}

fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL record"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(RECORD_OVERHEAD + u64::from(len))
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact payload, or `None` at end of log / first damaged record.
fn read_record(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Intact events and the byte length they span. A missing file is an empty log.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact_len = 0u64;
    while let Some(payload) = read_record(&mut reader)? {
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        intact_len += RECORD_OVERHEAD + payload.len() as u64;
    }
    Ok((events, intact_len))
}

impl Wal {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        Ok(Self::from_file(file, path, committed_len))
    }

    /// Replay the log and open it for appending, cutting off any damaged tail
    /// first so new records never land behind bytes replay would stop at.
    pub fn open_and_replay(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, intact_len) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact_len {
            tracing::warn!(
                "truncating {} damaged bytes at the end of {}",
                on_disk - intact_len,
                path.display()
            );
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        Ok((Self::from_file(file, path, intact_len), events))
    }

    fn from_file(file: File, path: &Path, committed_len: u64) -> Self {
        Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len,
            pending_len: 0,
            poisoned: false,
            #[cfg(test)]
            sync_fault: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append and fsync a single event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event without syncing.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other("WAL is poisoned after a failed rollback"));
        }
        self.pending_len += encode_record(&mut self.writer, event)?;
        Ok(())
    }

    /// Flush buffered records and fsync the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.take_sync_fault()?;
        self.writer.get_ref().sync_all()?;
        self.committed_len += self.pending_len;
        self.pending_len = 0;
        Ok(())
    }

    /// Throw away everything since the last successful `flush_sync`, both
    /// still-buffered bytes and bytes already written to the file.
    pub fn rollback(&mut self) -> io::Result<()> {
        let result = self.discard_pending();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn discard_pending(&mut self) -> io::Result<()> {
        let file = self.writer.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the file without flushing the buffer.
        let (_file, _unflushed) = stale.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        self.pending_len = 0;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_sync(&mut self) {
        self.sync_fault = true;
    }

    #[cfg(test)]
    fn take_sync_fault(&mut self) -> io::Result<()> {
        if std::mem::take(&mut self.sync_fault) {
            return Err(io::Error::other("injected fsync failure"));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn take_sync_fault(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Every intact event in the log, oldest first. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use ulid::Ulid;

    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("pewledger_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn created(id: &str, capacity: Option<u32>) -> Event {
        Event::ResourceCreated {
            id: id.into(),
            name: None,
            capacity,
        }
    }

    fn granted(resource_id: &str) -> Event {
        Event::AllocationGranted {
            id: Ulid::new(),
            resource_id: resource_id.into(),
            requester_id: "ann".into(),
            units: 2,
            request_token: "t1".into(),
            note: None,
            created_at: 1_000,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            created("harvest-supper", Some(40)),
            granted("harvest-supper"),
            Event::ReservationRejected {
                resource_id: "harvest-supper".into(),
                requester_id: "bob".into(),
                request_token: "t9".into(),
                units: 50,
            },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_appends_after_existing_records() {
        let path = tmp_path("reopen.wal");
        let first = created("youth-night", None);
        let second = granted("youth-night");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = created("retreat", Some(12));
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = created("choir", Some(30));
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&granted("choir")).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn buffered_records_land_after_flush() {
        let path = tmp_path("buffered.wal");
        let events: Vec<Event> = (0..5).map(|i| created(&format!("e{i}"), Some(i))).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            wal.flush_sync().unwrap();
            assert_eq!(wal.path(), path.as_path());
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn failed_sync_is_rolled_back() {
        let path = tmp_path("rollback.wal");
        let kept = created("bazaar", Some(8));
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        let synced_len = fs::metadata(&path).unwrap().len();

        wal.fail_next_sync();
        wal.append_buffered(&granted("bazaar")).unwrap();
        assert!(wal.flush_sync().is_err());
        // The failed record reached the file before the sync error.
        assert!(fs::metadata(&path).unwrap().len() > synced_len);

        wal.rollback().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), synced_len);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone()]);

        let next = created("rummage-sale", None);
        wal.append(&next).unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, next]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rollback_drops_unflushed_buffer() {
        let path = tmp_path("rollback_buffer.wal");
        let kept = created("advent-lunch", Some(20));
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();
        wal.append_buffered(&granted("advent-lunch")).unwrap();
        wal.rollback().unwrap();
        wal.flush_sync().unwrap();
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn damaged_tail_is_cut_before_new_appends() {
        let path = tmp_path("repair_tail.wal");
        let first = created("carol-sing", Some(60));
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2]).unwrap();
        }

        let second = granted("carol-sing");
        {
            let (mut wal, events) = Wal::open_and_replay(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);
        let _ = fs::remove_file(&path);
    }
}
