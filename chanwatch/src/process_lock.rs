//! Per-channel process locks.
//!
//! Two collectors on the same channel would race on its checkpoint and
//! continuity rows, so `scrape` holds one advisory OS file lock (flock) per
//! channel for the life of the process. Locks are scoped to the database
//! path, so separate databases never contend.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Locks held for every channel of one run.
pub struct ChannelGuards {
    _locks: Vec<ChannelLock>,
}

/// Lock every channel in `channels` or none of them.
pub fn acquire_channel_locks(db_path: &Path, channels: &[String]) -> Result<ChannelGuards> {
    acquire_in(&lock_dir(), db_path, channels)
}

fn acquire_in(dir: &Path, db_path: &Path, channels: &[String]) -> Result<ChannelGuards> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create lock directory {}", dir.display()))?;

    let mut locks = Vec::with_capacity(channels.len());
    for channel in channels {
        // Locks taken so far are released when `locks` drops on bail
        let lock = ChannelLock::try_acquire(dir.join(lock_filename(channel, db_path)), channel)?
            .with_context(|| {
                format!("channel {channel} is already being collected by another chanwatch process")
            })?;
        locks.push(lock);
    }
    Ok(ChannelGuards { _locks: locks })
}

struct ChannelLock {
    file: File,
    path: PathBuf,
}

impl ChannelLock {
    /// `Ok(None)` when another process holds the lock.
    fn try_acquire(path: PathBuf, channel: &str) -> Result<Option<Self>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        if let Err(e) = flock_op(&file, LOCK_EX | LOCK_NB) {
            if is_lock_busy(&e) {
                return Ok(None);
            }
            return Err(e).with_context(|| format!("failed to lock {}", path.display()));
        }

        // Owner details are informational only
        let _ = file.set_len(0);
        let _ = write!(file, "pid={}\nchannel={}\n", std::process::id(), channel);
        let _ = file.flush();
        Ok(Some(Self { file, path }))
    }
}

impl Drop for ChannelLock {
    fn drop(&mut self) {
        let _ = flock_op(&self.file, LOCK_UN);
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("chanwatch")
}

/// `channel-<name>.<db hash>.lock`, with the name reduced to a safe charset.
fn lock_filename(channel: &str, db_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    db_path.hash(&mut hasher);
    let safe: String = channel
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect();
    format!("channel-{}.{:016x}.lock", safe, hasher.finish())
}

/// EWOULDBLOCK is 11 on Linux and 35 on macOS.
fn is_lock_busy(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock || matches!(error.raw_os_error(), Some(11 | 35))
}

const LOCK_EX: i32 = 2;
const LOCK_NB: i32 = 4;
const LOCK_UN: i32 = 8;

#[cfg(unix)]
fn flock_op(file: &File, operation: i32) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and outlives the call.
    match unsafe { flock(file.as_raw_fd(), operation) } {
        0 => Ok(()),
        _ => Err(io::Error::last_os_error()),
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("chanwatch channel locks require a Unix flock(2)");
