#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::primitives::io::FileIo;
use crate::types::{clone_error, Checksum, Crc32Fast, EngineError, Lsn, Result, TxId};

const WAL_MAGIC: [u8; 4] = *b"EGWL";
const WAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const ENTRY_HEADER_LEN: usize = 36;
/// Upper bound on a single entry payload; larger lengths are treated as garbage.
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Operation code carried by every WAL entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum WalOp {
    /// Full image of a newly created node.
    CreateNode = 1,
    /// Full image of a newly created edge.
    CreateEdge = 2,
    /// After-image of an updated node.
    UpdateNode = 3,
    /// After-image of an updated edge.
    UpdateEdge = 4,
    /// Node removal.
    DeleteNode = 5,
    /// Edge removal.
    DeleteEdge = 6,
    /// Commit marker; its LSN is the transaction's commit id.
    Commit = 7,
}

impl TryFrom<u16> for WalOp {
    type Error = EngineError;

    fn try_from(value: u16) -> Result<Self> {
        Ok(match value {
            1 => WalOp::CreateNode,
            2 => WalOp::CreateEdge,
            3 => WalOp::UpdateNode,
            4 => WalOp::UpdateEdge,
            5 => WalOp::DeleteNode,
            6 => WalOp::DeleteEdge,
            7 => WalOp::Commit,
            _ => return Err(EngineError::Corruption("unknown wal opcode")),
        })
    }
}

/// One logical WAL entry.
#[derive(Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Sequence number, strictly increasing across the log.
    pub lsn: Lsn,
    /// Owning transaction.
    pub tx: TxId,
    /// Operation code.
    pub op: WalOp,
    /// Encoded mutation; empty for commit markers.
    pub payload: Vec<u8>,
}

impl fmt::Debug for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalRecord")
            .field("lsn", &self.lsn)
            .field("tx", &self.tx)
            .field("op", &self.op)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Options for opening a WAL file.
#[derive(Clone, Debug)]
pub struct WalOptions {
    /// Random value distinguishing database instances.
    pub salt: u64,
    /// First LSN this log may contain.
    pub start_lsn: Lsn,
}

/// Counters describing WAL activity since open.
#[derive(Clone, Debug, Default)]
pub struct WalStats {
    /// Entries appended.
    pub entries_appended: u64,
    /// Bytes appended, headers included.
    pub bytes_appended: u64,
    /// Append calls (each one contiguous write).
    pub batches: u64,
    /// Completed syncs.
    pub syncs: u64,
}

/// How a recovery scan ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalTail {
    /// Every byte belonged to a valid entry.
    Clean,
    /// A partial or invalid trailing entry was found and discarded.
    Torn,
}

/// Outcome of [`Wal::recover`].
#[derive(Clone, Debug)]
pub struct WalScan {
    /// Entries that passed validation, in log order.
    pub records: Vec<WalRecord>,
    /// File offset up to which entries are valid.
    pub valid_up_to: u64,
    /// Bytes discarded past `valid_up_to`.
    pub discarded_bytes: u64,
    /// Tail classification.
    pub tail: WalTail,
    /// Start LSN recorded in the file header.
    pub start_lsn: Lsn,
}

#[derive(Clone, Debug)]
struct FileHeader {
    salt: u64,
    start_lsn: Lsn,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.salt.to_be_bytes());
        buf[16..24].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = Crc32Fast::of(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != WAL_MAGIC {
            return Err(EngineError::Corruption("wal magic mismatch"));
        }
        if u16::from_be_bytes([src[4], src[5]]) != WAL_FORMAT_VERSION {
            return Err(EngineError::Corruption("wal format version mismatch"));
        }
        if read_u32(src, 28) != Crc32Fast::of(&[&src[..28]]) {
            return Err(EngineError::Corruption("wal header crc mismatch"));
        }
        Ok(Self {
            salt: read_u64(src, 8),
            start_lsn: Lsn(read_u64(src, 16)),
        })
    }
}

#[derive(Clone, Debug)]
struct EntryHeader {
    lsn: Lsn,
    tx: TxId,
    op: u16,
    payload_len: u32,
    prev_chain: u32,
    payload_crc: u32,
}

impl EntryHeader {
    fn encode(&self) -> [u8; ENTRY_HEADER_LEN] {
        let mut buf = [0u8; ENTRY_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        buf[8..16].copy_from_slice(&self.tx.0.to_be_bytes());
        buf[16..18].copy_from_slice(&self.op.to_be_bytes());
        buf[20..24].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[24..28].copy_from_slice(&self.prev_chain.to_be_bytes());
        buf[28..32].copy_from_slice(&self.payload_crc.to_be_bytes());
        let crc = Crc32Fast::of(&[&buf[..32]]);
        buf[32..36].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Returns `None` when the header checksum does not match.
    fn decode(src: &[u8; ENTRY_HEADER_LEN]) -> Option<Self> {
        if read_u32(src, 32) != Crc32Fast::of(&[&src[..32]]) {
            return None;
        }
        Some(Self {
            lsn: Lsn(read_u64(src, 0)),
            tx: TxId(read_u64(src, 8)),
            op: u16::from_be_bytes([src[16], src[17]]),
            payload_len: read_u32(src, 20),
            prev_chain: read_u32(src, 24),
            payload_crc: read_u32(src, 28),
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(raw)
}

fn chain_crc(prev: u32, header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&prev.to_be_bytes());
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

#[derive(Clone, Copy)]
struct AppendPoint {
    offset: u64,
    chain: u32,
    lsn: Lsn,
}

struct WalState {
    header: FileHeader,
    append_offset: u64,
    prev_chain: u32,
    last_lsn: Lsn,
    /// Append point covered by the last successful sync.
    synced: AppendPoint,
    stats: WalStats,
}

impl WalState {
    fn append_point(&self) -> AppendPoint {
        AppendPoint {
            offset: self.append_offset,
            chain: self.prev_chain,
            lsn: self.last_lsn,
        }
    }
}

/// Append-only log of checksummed, chained entries.
///
/// Each entry header carries the CRC of the previous entry so a stale or
/// spliced entry is detected even when its own checksums are intact.
pub struct Wal {
    io: Arc<dyn FileIo>,
    state: Mutex<WalState>,
}

impl Wal {
    /// Opens the log, scans it, truncates a torn tail and positions the append
    /// point after the last valid entry.
    ///
    /// Mid-log damage (an invalid entry followed by more data that still
    /// parses) is reported as [`EngineError::Corruption`].
    pub fn recover(io: Arc<dyn FileIo>, options: WalOptions) -> Result<(Self, WalScan)> {
        let len = io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            if len > 0 {
                warn!(len, "wal.recover.truncated_header");
            }
            let header = FileHeader {
                salt: options.salt,
                start_lsn: options.start_lsn,
            };
            io.truncate(0)?;
            io.write_at(0, &header.encode())?;
            io.sync_all()?;
            let start_lsn = header.start_lsn;
            let wal = Self::with_state(io, header, FILE_HEADER_LEN as u64, 0, prev_lsn(start_lsn));
            return Ok((
                wal,
                WalScan {
                    records: Vec::new(),
                    valid_up_to: FILE_HEADER_LEN as u64,
                    discarded_bytes: 0,
                    tail: WalTail::Clean,
                    start_lsn,
                },
            ));
        }
        let mut raw = [0u8; FILE_HEADER_LEN];
        io.read_at(0, &mut raw)?;
        let header = FileHeader::decode(&raw)?;
        let scan = scan_entries(io.as_ref(), &header, len)?;
        if scan.tail == WalTail::Torn {
            warn!(
                valid_up_to = scan.valid_up_to,
                discarded = scan.discarded_bytes,
                "wal.recover.torn_tail"
            );
            io.truncate(scan.valid_up_to)?;
            io.sync_all()?;
        }
        let (prev_chain, last_lsn) = scan.chain_state;
        let last_lsn = last_lsn.unwrap_or_else(|| prev_lsn(header.start_lsn));
        let wal = Self::with_state(io, header, scan.valid_up_to, prev_chain, last_lsn);
        Ok((wal, scan.into_public()))
    }

    fn with_state(
        io: Arc<dyn FileIo>,
        header: FileHeader,
        append_offset: u64,
        prev_chain: u32,
        last_lsn: Lsn,
    ) -> Self {
        Self {
            io,
            state: Mutex::new(WalState {
                header,
                append_offset,
                prev_chain,
                last_lsn,
                synced: AppendPoint {
                    offset: append_offset,
                    chain: prev_chain,
                    lsn: last_lsn,
                },
                stats: WalStats::default(),
            }),
        }
    }

    /// Discards every entry and restarts the log at `start_lsn`.
    pub fn reset(&self, start_lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        state.header.start_lsn = start_lsn;
        self.io.truncate(0)?;
        self.io.write_at(0, &state.header.encode())?;
        self.io.sync_all()?;
        state.append_offset = FILE_HEADER_LEN as u64;
        state.prev_chain = 0;
        state.last_lsn = prev_lsn(start_lsn);
        state.synced = state.append_point();
        debug!(start_lsn = start_lsn.0, "wal.reset");
        Ok(())
    }

    /// Appends entries as one contiguous write. LSNs must be strictly
    /// increasing and above every entry already in the log. Does not sync.
    pub fn append_batch(&self, records: &[WalRecord]) -> Result<Lsn> {
        let mut state = self.state.lock();
        if records.is_empty() {
            return Ok(state.last_lsn);
        }
        let mut expected_floor = state.last_lsn;
        for record in records {
            if record.lsn <= expected_floor {
                return Err(EngineError::Invalid("wal lsn must increase"));
            }
            if record.lsn < state.header.start_lsn {
                return Err(EngineError::Invalid("wal lsn below start_lsn"));
            }
            if record.payload.len() as u64 > u64::from(MAX_PAYLOAD_LEN) {
                return Err(EngineError::Invalid("wal payload too large"));
            }
            expected_floor = record.lsn;
        }
        let total: usize = records
            .iter()
            .map(|r| ENTRY_HEADER_LEN + r.payload.len())
            .sum();
        let mut buf = Vec::with_capacity(total);
        let mut chain = state.prev_chain;
        for record in records {
            let header = EntryHeader {
                lsn: record.lsn,
                tx: record.tx,
                op: record.op as u16,
                payload_len: record.payload.len() as u32,
                prev_chain: chain,
                payload_crc: Crc32Fast::of(&[&record.payload]),
            };
            let encoded = header.encode();
            chain = chain_crc(chain, &encoded, &record.payload);
            buf.extend_from_slice(&encoded);
            buf.extend_from_slice(&record.payload);
        }
        self.io.write_at(state.append_offset, &buf)?;
        state.append_offset += buf.len() as u64;
        state.prev_chain = chain;
        state.last_lsn = expected_floor;
        state.stats.entries_appended += records.len() as u64;
        state.stats.bytes_appended += buf.len() as u64;
        state.stats.batches += 1;
        Ok(expected_floor)
    }

    /// Flushes appended entries to stable storage.
    pub fn sync(&self) -> Result<()> {
        let covered = self.state.lock().append_point();
        self.io.sync_all()?;
        let mut state = self.state.lock();
        state.stats.syncs += 1;
        if covered.offset > state.synced.offset {
            state.synced = covered;
        }
        Ok(())
    }

    /// Drops every entry written after the last successful sync and moves the
    /// append point back. Used after a failed sync so entries whose commit
    /// was reported as failed cannot resurface on recovery.
    pub fn discard_unsynced(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        let synced = state.synced;
        if state.append_offset > synced.offset {
            warn!(
                from = synced.offset,
                bytes = state.append_offset - synced.offset,
                "wal.discard_unsynced"
            );
            self.io.truncate(synced.offset)?;
        }
        state.append_offset = synced.offset;
        state.prev_chain = synced.chain;
        state.last_lsn = synced.lsn;
        Ok(synced.lsn)
    }

    /// LSN of the last appended entry (or `start_lsn - 1` when empty).
    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().last_lsn
    }

    /// Start LSN from the file header.
    pub fn start_lsn(&self) -> Lsn {
        self.state.lock().header.start_lsn
    }

    /// Current statistics.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Total size of the log in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true when the log holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }
}

fn prev_lsn(lsn: Lsn) -> Lsn {
    Lsn(lsn.0.saturating_sub(1))
}

struct RawScan {
    records: Vec<WalRecord>,
    valid_up_to: u64,
    discarded_bytes: u64,
    tail: WalTail,
    start_lsn: Lsn,
    chain_state: (u32, Option<Lsn>),
}

impl RawScan {
    fn into_public(self) -> WalScan {
        WalScan {
            records: self.records,
            valid_up_to: self.valid_up_to,
            discarded_bytes: self.discarded_bytes,
            tail: self.tail,
            start_lsn: self.start_lsn,
        }
    }
}

enum EntryCheck {
    Valid(EntryHeader, [u8; ENTRY_HEADER_LEN], Vec<u8>),
    Damaged,
}

fn read_entry(io: &dyn FileIo, offset: u64, end: u64) -> Result<EntryCheck> {
    if offset + ENTRY_HEADER_LEN as u64 > end {
        return Ok(EntryCheck::Damaged);
    }
    let mut raw = [0u8; ENTRY_HEADER_LEN];
    io.read_at(offset, &mut raw)?;
    let Some(header) = EntryHeader::decode(&raw) else {
        return Ok(EntryCheck::Damaged);
    };
    if header.payload_len > MAX_PAYLOAD_LEN {
        return Ok(EntryCheck::Damaged);
    }
    let payload_end = offset + ENTRY_HEADER_LEN as u64 + u64::from(header.payload_len);
    if payload_end > end {
        return Ok(EntryCheck::Damaged);
    }
    let mut payload = vec![0u8; header.payload_len as usize];
    io.read_at(offset + ENTRY_HEADER_LEN as u64, &mut payload)?;
    if Crc32Fast::of(&[&payload]) != header.payload_crc {
        return Ok(EntryCheck::Damaged);
    }
    Ok(EntryCheck::Valid(header, raw, payload))
}

/// Looks for an intact entry anywhere in `from..end` whose LSN is above
/// `floor`. A hit means the damage is not a crash boundary.
fn intact_entry_after(io: &dyn FileIo, from: u64, end: u64, floor: Lsn) -> Result<Option<u64>> {
    if from + ENTRY_HEADER_LEN as u64 > end {
        return Ok(None);
    }
    let mut region = vec![0u8; (end - from) as usize];
    io.read_at(from, &mut region)?;
    for at in 0..=region.len() - ENTRY_HEADER_LEN {
        let mut raw = [0u8; ENTRY_HEADER_LEN];
        raw.copy_from_slice(&region[at..at + ENTRY_HEADER_LEN]);
        let Some(header) = EntryHeader::decode(&raw) else {
            continue;
        };
        if header.lsn <= floor || WalOp::try_from(header.op).is_err() {
            continue;
        }
        let payload_start = at + ENTRY_HEADER_LEN;
        let Some(payload) = region.get(payload_start..payload_start + header.payload_len as usize)
        else {
            continue;
        };
        if Crc32Fast::of(&[payload]) == header.payload_crc {
            return Ok(Some(from + at as u64));
        }
    }
    Ok(None)
}

fn scan_entries(io: &dyn FileIo, file_header: &FileHeader, end: u64) -> Result<RawScan> {
    let mut offset = FILE_HEADER_LEN as u64;
    let mut chain = 0u32;
    let mut last_lsn: Option<Lsn> = None;
    let mut records = Vec::new();
    while offset < end {
        match read_entry(io, offset, end)? {
            EntryCheck::Valid(header, raw, payload) => {
                if header.prev_chain != chain {
                    return Err(EngineError::Corruption("wal chain mismatch"));
                }
                if header.lsn < file_header.start_lsn || last_lsn.is_some_and(|l| header.lsn <= l) {
                    return Err(EngineError::Corruption("wal lsn out of order"));
                }
                let op = WalOp::try_from(header.op)?;
                chain = chain_crc(chain, &raw, &payload);
                let next = offset + ENTRY_HEADER_LEN as u64 + payload.len() as u64;
                last_lsn = Some(header.lsn);
                records.push(WalRecord {
                    lsn: header.lsn,
                    tx: header.tx,
                    op,
                    payload,
                });
                offset = next;
            }
            EntryCheck::Damaged => {
                let floor = last_lsn.unwrap_or_else(|| prev_lsn(file_header.start_lsn));
                if let Some(found) = intact_entry_after(io, offset + 1, end, floor)? {
                    error!(offset, found, "wal.scan.mid_log_corruption");
                    return Err(EngineError::Corruption(
                        "wal entry checksum mismatch before valid entries",
                    ));
                }
                return Ok(RawScan {
                    records,
                    valid_up_to: offset,
                    discarded_bytes: end - offset,
                    tail: WalTail::Torn,
                    start_lsn: file_header.start_lsn,
                    chain_state: (chain, last_lsn),
                });
            }
        }
    }
    Ok(RawScan {
        records,
        valid_up_to: offset,
        discarded_bytes: 0,
        tail: WalTail::Clean,
        start_lsn: file_header.start_lsn,
        chain_state: (chain, last_lsn),
    })
}

/// Durability policy applied to committed transactions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalSyncMode {
    /// Never force a flush.
    Off,
    /// Flush on a fixed interval.
    Batch(Duration),
    /// Flush before acknowledging each commit; concurrent commits share one flush.
    Immediate,
}

#[derive(Default)]
struct FlushState {
    requested: u64,
    synced: u64,
    shutdown: bool,
    failure: Option<EngineError>,
}

/// Background flusher that turns appended entries into durable ones.
///
/// In `Immediate` mode, committers call [`WalFlusher::wait_durable`]; while one
/// fsync is in flight further requests accumulate and the next fsync covers
/// all of them (group commit). In `Batch` mode the worker flushes on a timer.
pub struct WalFlusher {
    wal: Arc<Wal>,
    mode: WalSyncMode,
    state: Arc<Mutex<FlushState>>,
    wakeup: Arc<Condvar>,
    done: Arc<Condvar>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WalFlusher {
    /// Creates a flusher and starts its worker when the mode needs one.
    pub fn start(wal: Arc<Wal>, mode: WalSyncMode) -> Self {
        let synced = wal.last_lsn().0;
        let flusher = Self {
            wal,
            mode,
            state: Arc::new(Mutex::new(FlushState {
                synced,
                requested: synced,
                ..FlushState::default()
            })),
            wakeup: Arc::new(Condvar::new()),
            done: Arc::new(Condvar::new()),
            worker: Mutex::new(None),
        };
        if !matches!(mode, WalSyncMode::Off) {
            let wal = Arc::clone(&flusher.wal);
            let state = Arc::clone(&flusher.state);
            let wakeup = Arc::clone(&flusher.wakeup);
            let done = Arc::clone(&flusher.done);
            let handle = thread::Builder::new()
                .name("engramdb-wal-flush".into())
                .spawn(move || Self::worker_loop(wal, mode, state, wakeup, done));
            match handle {
                Ok(handle) => *flusher.worker.lock() = Some(handle),
                Err(err) => error!(?err, "wal.flusher.spawn_failed"),
            }
        }
        flusher
    }

    /// Configured sync mode.
    pub fn mode(&self) -> WalSyncMode {
        self.mode
    }

    /// Blocks until every entry up to `lsn` is durable. Returns immediately in
    /// `Off` and `Batch` modes.
    pub fn wait_durable(&self, lsn: Lsn) -> Result<()> {
        if !matches!(self.mode, WalSyncMode::Immediate) {
            return Ok(());
        }
        if self.worker.lock().is_none() {
            return self.sync_now();
        }
        let mut state = self.state.lock();
        if state.synced >= lsn.0 {
            return Ok(());
        }
        state.requested = state.requested.max(lsn.0);
        self.wakeup.notify_one();
        loop {
            if let Some(err) = &state.failure {
                return Err(clone_error(err));
            }
            if state.synced >= lsn.0 {
                return Ok(());
            }
            if state.shutdown {
                drop(state);
                return self.sync_now();
            }
            self.done.wait(&mut state);
        }
    }

    /// Flushes synchronously from the calling thread.
    pub fn sync_now(&self) -> Result<()> {
        let target = self.wal.last_lsn().0;
        self.wal.sync()?;
        let mut state = self.state.lock();
        state.synced = state.synced.max(target);
        self.done.notify_all();
        Ok(())
    }

    /// Highest LSN known to be durable.
    pub fn durable_lsn(&self) -> Lsn {
        Lsn(self.state.lock().synced)
    }

    /// Stops the worker after a final flush attempt.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
        }
        self.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("wal.flusher.worker_panicked");
            }
        }
    }

    fn worker_loop(
        wal: Arc<Wal>,
        mode: WalSyncMode,
        state: Arc<Mutex<FlushState>>,
        wakeup: Arc<Condvar>,
        done: Arc<Condvar>,
    ) {
        loop {
            {
                let mut guard = state.lock();
                match mode {
                    WalSyncMode::Immediate => {
                        while guard.requested <= guard.synced && !guard.shutdown {
                            wakeup.wait(&mut guard);
                        }
                    }
                    WalSyncMode::Batch(interval) => {
                        if !guard.shutdown {
                            wakeup.wait_for(&mut guard, interval);
                        }
                    }
                    WalSyncMode::Off => return,
                }
                if guard.failure.is_some() {
                    return;
                }
                if guard.shutdown && wal.last_lsn().0 <= guard.synced {
                    return;
                }
            }
            let target = wal.last_lsn().0;
            let needs_sync = target > state.lock().synced;
            if needs_sync {
                let outcome = wal.sync();
                let mut guard = state.lock();
                match outcome {
                    Ok(()) => {
                        guard.synced = guard.synced.max(target);
                        debug!(synced = guard.synced, "wal.flusher.synced");
                    }
                    Err(err) => {
                        error!(%err, "wal.flusher.sync_failed");
                        guard.failure = Some(err);
                    }
                }
                done.notify_all();
            }
            if state.lock().shutdown {
                return;
            }
        }
    }
}

impl Drop for WalFlusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
