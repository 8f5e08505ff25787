// SPDX-License-Identifier: AGPL-3.0-or-later
// RillDB - In-Memory Transactional Storage Engine
// Copyright (C) 2026 RillDB Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Snapshot files and the snapshot directory.
//!
//! File layout:
//!
//! ```text
//! [magic "RSNP"] [version: u32 le]
//! [meta frame]               bincode SnapMeta (the file's vector clock)
//! [row frame]*               bincode SnapRow
//! [EOF marker]
//! ```
//!
//! Every frame is `[payload_len: u32 le] [crc32: u32 le] [payload]`; the EOF
//! marker is a frame with zero length and a fixed crc constant. A snapshot
//! missing its EOF marker must not be trusted: it was cut short mid-write.
//!
//! Filenames derive from the vector-clock signature (`sum()`), zero-padded
//! so lexicographic order matches signature order, with an `.inprogress`
//! suffix while the file is being written.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rilldb_core::{Result, RillError, SnapRow, VClock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const SNAP_MAGIC: &[u8; 4] = b"RSNP";
const SNAP_VERSION: u32 = 1;
const EOF_CRC: u32 = 0x454f_4621;

/// Disk sync interval for the snapshot writer: every 16 MiB of output.
pub const SNAP_SYNC_INTERVAL: u64 = 1 << 24;

const SNAP_SUFFIX: &str = ".snap";
const INPROGRESS_SUFFIX: &str = ".snap.inprogress";

/// Writer options: sync cadence and an optional byte-rate limit.
#[derive(Debug, Clone)]
pub struct SnapOpts {
    pub sync_interval: u64,
    /// Bytes per second, if limited.
    pub rate_limit: Option<u64>,
}

impl Default for SnapOpts {
    fn default() -> Self {
        Self {
            sync_interval: SNAP_SYNC_INTERVAL,
            rate_limit: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapMeta {
    vclock: VClock,
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn eof_marker() -> [u8; 8] {
    let mut marker = [0u8; 8];
    marker[4..].copy_from_slice(&EOF_CRC.to_le_bytes());
    marker
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| RillError::Serialization(e.to_string()))
}

/// Simple token-window byte-rate limiter for snapshot writes.
struct RateLimiter {
    limit: Option<u64>,
    window_start: Instant,
    bytes_in_window: u64,
}

impl RateLimiter {
    fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            window_start: Instant::now(),
            bytes_in_window: 0,
        }
    }

    fn consumed(&mut self, bytes: u64) {
        let Some(limit) = self.limit else { return };
        let elapsed = self.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.bytes_in_window = 0;
        }
        self.bytes_in_window += bytes;
        if self.bytes_in_window > limit {
            std::thread::sleep(Duration::from_secs(1).saturating_sub(elapsed));
            self.window_start = Instant::now();
            self.bytes_in_window = 0;
        }
    }
}

/// Streaming snapshot writer. Rows are framed and checksummed; LSNs are
/// assigned densely from 1; the timestamp is captured once at creation.
pub struct SnapWriter {
    file: BufWriter<File>,
    path: PathBuf,
    rows: u64,
    bytes_since_sync: u64,
    rate: RateLimiter,
    tm: f64,
}

impl SnapWriter {
    pub fn create(path: &Path, vclock: &VClock, opts: &SnapOpts) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = Self {
            file: BufWriter::new(file),
            path: path.to_path_buf(),
            rows: 0,
            bytes_since_sync: 0,
            rate: RateLimiter::new(opts.rate_limit),
            tm: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
        };
        writer.file.write_all(SNAP_MAGIC)?;
        writer.file.write_all(&SNAP_VERSION.to_le_bytes())?;
        let meta = serialize(&SnapMeta {
            vclock: vclock.clone(),
        })?;
        writer.write_frame(&encode_frame(&meta), opts)?;
        Ok(writer)
    }

    fn write_frame(&mut self, frame: &[u8], opts: &SnapOpts) -> Result<()> {
        self.file.write_all(frame)?;
        self.bytes_since_sync += frame.len() as u64;
        self.rate.consumed(frame.len() as u64);
        if self.bytes_since_sync >= opts.sync_interval {
            self.file.flush()?;
            self.file.get_ref().sync_data()?;
            self.bytes_since_sync = 0;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Frame one row, stamping its LSN (dense, 1-based) and timestamp.
    pub fn write_row(&mut self, mut row: SnapRow, opts: &SnapOpts) -> Result<()> {
        row.lsn = self.rows + 1;
        row.tm = self.tm;
        row.replica_id = 0;
        row.sync = 0;
        let payload = serialize(&row)?;
        self.write_frame(&encode_frame(&payload), opts)?;
        self.rows += 1;
        if self.rows % 100_000 == 0 {
            info!(rows = self.rows, "snapshot rows written");
        }
        Ok(())
    }

    /// Write the EOF marker and make the file durable.
    pub fn finish(mut self) -> Result<()> {
        self.file.write_all(&eof_marker())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}

/// Build an in-memory snapshot image (used for the embedded bootstrap
/// image). Same layout as an on-disk snapshot.
pub fn build_image(vclock: &VClock, rows: &[SnapRow]) -> Result<Vec<u8>> {
    let mut image = Vec::new();
    image.extend_from_slice(SNAP_MAGIC);
    image.extend_from_slice(&SNAP_VERSION.to_le_bytes());
    let meta = serialize(&SnapMeta {
        vclock: vclock.clone(),
    })?;
    image.extend_from_slice(&encode_frame(&meta));
    for (i, row) in rows.iter().enumerate() {
        let mut row = row.clone();
        row.lsn = i as u64 + 1;
        image.extend_from_slice(&encode_frame(&serialize(&row)?));
    }
    image.extend_from_slice(&eof_marker());
    Ok(image)
}

/// Streaming reader over a snapshot file or an in-memory image.
pub struct SnapCursor<R> {
    input: R,
    name: String,
    vclock: VClock,
    eof_seen: bool,
}

impl SnapCursor<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::init(BufReader::new(file), path.display().to_string())
    }
}

impl<'a> SnapCursor<std::io::Cursor<&'a [u8]>> {
    pub fn from_image(image: &'a [u8], name: &str) -> Result<Self> {
        Self::init(std::io::Cursor::new(image), name.to_string())
    }
}

impl<R: Read> SnapCursor<R> {
    fn init(mut input: R, name: String) -> Result<Self> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic).map_err(|_| {
            RillError::CorruptSnapshot(format!("`{name}': missing file header"))
        })?;
        if &magic != SNAP_MAGIC {
            return Err(RillError::CorruptSnapshot(format!(
                "`{name}': bad magic"
            )));
        }
        let mut version = [0u8; 4];
        input.read_exact(&mut version)?;
        let version = u32::from_le_bytes(version);
        if version != SNAP_VERSION {
            return Err(RillError::CorruptSnapshot(format!(
                "`{name}': unsupported version {version}"
            )));
        }
        let mut cursor = Self {
            input,
            name,
            vclock: VClock::new(),
            eof_seen: false,
        };
        let meta = cursor.read_frame()?.ok_or_else(|| {
            RillError::CorruptSnapshot(format!("`{}': missing metadata", cursor.name))
        })?;
        let meta: SnapMeta = bincode::deserialize(&meta)
            .map_err(|e| RillError::Serialization(e.to_string()))?;
        cursor.vclock = meta.vclock;
        Ok(cursor)
    }

    /// The vector clock the file was written with.
    pub fn vclock(&self) -> &VClock {
        &self.vclock
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the EOF marker has been reached. A cursor that stopped
    /// yielding rows without this flag read a truncated file.
    pub fn is_eof(&self) -> bool {
        self.eof_seen
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut head = [0u8; 8];
        match self.input.read_exact(&mut head) {
            Ok(()) => {}
            // Plain end of input: no marker. The caller decides whether
            // that is fatal.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(head[..4].try_into().unwrap());
        let crc = u32::from_le_bytes(head[4..].try_into().unwrap());
        if len == 0 {
            if crc == EOF_CRC {
                self.eof_seen = true;
                return Ok(None);
            }
            return Err(RillError::CorruptSnapshot(format!(
                "`{}': zero-length frame with bad marker",
                self.name
            )));
        }
        let mut payload = vec![0u8; len as usize];
        self.input.read_exact(&mut payload).map_err(|_| {
            RillError::CorruptSnapshot(format!("`{}': truncated frame", self.name))
        })?;
        if crc32fast::hash(&payload) != crc {
            return Err(RillError::CorruptSnapshot(format!(
                "`{}': frame checksum mismatch",
                self.name
            )));
        }
        Ok(Some(payload))
    }

    /// Next row, or `None` at end of input (check `is_eof`).
    pub fn next_row(&mut self) -> Result<Option<SnapRow>> {
        if self.eof_seen {
            return Ok(None);
        }
        let Some(payload) = self.read_frame()? else {
            return Ok(None);
        };
        let row = bincode::deserialize(&payload)
            .map_err(|e| RillError::Serialization(e.to_string()))?;
        Ok(Some(row))
    }
}

/// Update the mtime of an existing snapshot file (touch-only checkpoint).
pub fn touch_snapshot(path: &Path) -> Result<()> {
    let file = OpenOptions::new().append(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}

/// The snapshot directory: known checkpoints sorted by signature.
pub struct SnapDir {
    path: PathBuf,
    pub opts: SnapOpts,
    index: Vec<VClock>,
}

impl SnapDir {
    pub fn new(path: &Path, opts: SnapOpts) -> Result<Self> {
        fs::create_dir_all(path)?;
        let mut dir = Self {
            path: path.to_path_buf(),
            opts,
            index: Vec::new(),
        };
        dir.scan()?;
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild the checkpoint index from the files on disk.
    pub fn scan(&mut self) -> Result<()> {
        self.index.clear();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(SNAP_SUFFIX) || name.ends_with(INPROGRESS_SUFFIX) {
                continue;
            }
            match SnapCursor::open(&entry.path()) {
                Ok(cursor) => self.index.push(cursor.vclock().clone()),
                Err(err) => {
                    warn!(file = name, error = %err, "skipping unreadable snapshot");
                }
            }
        }
        self.index.sort_by_key(VClock::sum);
        Ok(())
    }

    pub fn format_filename(&self, signature: i64, inprogress: bool) -> PathBuf {
        let suffix = if inprogress {
            INPROGRESS_SUFFIX
        } else {
            SNAP_SUFFIX
        };
        self.path.join(format!("{signature:020}{suffix}"))
    }

    pub fn checkpoints(&self) -> &[VClock] {
        &self.index
    }

    pub fn last_vclock(&self) -> Option<&VClock> {
        self.index.last()
    }

    pub fn contains(&self, signature: i64) -> bool {
        self.index.iter().any(|v| v.sum() == signature)
    }

    /// Register a newly committed checkpoint.
    pub fn add_vclock(&mut self, vclock: VClock) {
        self.index.push(vclock);
        self.index.sort_by_key(VClock::sum);
    }

    /// Remove snapshots older than `signature`.
    pub fn collect_garbage(&mut self, signature: i64) -> Result<()> {
        let (drop_list, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.index)
                .into_iter()
                .partition(|v| v.sum() < signature);
        self.index = keep;
        for vclock in drop_list {
            let path = self.format_filename(vclock.sum(), false);
            info!(file = %path.display(), "collecting old snapshot");
            if let Err(err) = fs::remove_file(&path) {
                warn!(file = %path.display(), error = %err, "failed to remove old snapshot");
            }
        }
        Ok(())
    }

    /// Remove abandoned `.inprogress` files left by interrupted checkpoints.
    pub fn collect_inprogress(&self) -> Result<()> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(INPROGRESS_SUFFIX) {
                info!(file = name, "removing abandoned in-progress snapshot");
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}
