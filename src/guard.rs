//! Cross-process concurrency gate: singleton file locks with PID liveness
//! and a staleness TTL, a RAM preflight, and detached worker spawning.
//!
//! A lock is a small JSON record at a well-known path. Acquisition:
//! no record → own it; record older than the TTL → own it; owner pid dead →
//! own it; otherwise the caller backs off.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::MnemoError;
use crate::store::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at_epoch_ms: i64,
    pub owner: String,
}

/// Is the process alive? A no-op probe: on Linux `/proc/<pid>` existing is
/// the answer; elsewhere we can't tell cheaply and let the TTL decide.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}

pub struct Lock {
    path: PathBuf,
    stale_ttl: Duration,
}

impl Lock {
    pub fn new(path: impl Into<PathBuf>, stale_ttl: Duration) -> Self {
        Self { path: path.into(), stale_ttl }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record, if the file exists and parses.
    pub fn status(&self) -> Option<LockRecord> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Would an acquisition succeed right now? Read-only probe: reports
    /// `LockHeld` when a fresh record's owner is alive, touches nothing.
    pub fn takeable(&self) -> Result<(), MnemoError> {
        let Some(record) = self.status() else {
            return Ok(());
        };
        let age_ms = now_ms() - record.acquired_at_epoch_ms;
        if age_ms > self.stale_ttl.as_millis() as i64 {
            warn!(pid = record.pid, age_ms, "taking over stale lock");
            return Ok(());
        }
        if !pid_alive(record.pid) {
            warn!(pid = record.pid, "taking over lock from dead process");
            return Ok(());
        }
        Err(MnemoError::LockHeld(record.pid))
    }

    fn write_record(&self, pid: u32, owner: &str) -> Result<(), MnemoError> {
        let record = LockRecord {
            pid,
            acquired_at_epoch_ms: now_ms(),
            owner: owner.to_string(),
        };
        // temp + rename so a reader never sees a torn record
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, serde_json::to_string(&record).expect("lock record json"))
            .map_err(|e| MnemoError::Internal(format!("write lock: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| MnemoError::Internal(format!("rename lock: {e}")))?;
        Ok(())
    }

    /// Acquire for this process. The returned guard removes the lock on drop.
    pub fn acquire(&self, owner: &str) -> Result<LockGuard, MnemoError> {
        self.takeable()?;
        self.write_record(std::process::id(), owner)?;
        debug!(path = %self.path.display(), owner, "lock acquired");
        Ok(LockGuard { path: self.path.clone(), pid: std::process::id() })
    }

    /// Acquire on behalf of a child process (hook → worker handoff). The
    /// worker adopts the lock at startup and removes it on exit.
    pub fn acquire_for_pid(&self, owner: &str, pid: u32) -> Result<(), MnemoError> {
        self.takeable()?;
        self.write_record(pid, owner)
    }

    /// Adopt a lock this process is already recorded in (worker side).
    /// Falls back to plain acquisition if the record went missing.
    pub fn adopt(&self, owner: &str) -> Result<LockGuard, MnemoError> {
        let me = std::process::id();
        match self.status() {
            Some(record) if record.pid == me => {
                Ok(LockGuard { path: self.path.clone(), pid: me })
            }
            _ => self.acquire(owner),
        }
    }
}

/// Removes the lock file on every exit path, including panics. A SIGKILL
/// leaves the file behind; the TTL and liveness probe reclaim it.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // only remove the lock if it is still ours
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LockRecord>(&raw).ok())
            .is_some_and(|r| r.pid == self.pid);
        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove lock");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RAM preflight
// ---------------------------------------------------------------------------

/// Free memory in MiB from /proc/meminfo. None on platforms without it —
/// the preflight then passes (same stance as the liveness probe).
pub fn free_mem_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                return Some(kb / 1024);
            }
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Abort (as `ResourceExhausted`) when free memory is below the floor.
pub fn check_ram(min_free_mb: u64) -> Result<(), MnemoError> {
    if let Some(free) = free_mem_mb() {
        if free < min_free_mb {
            return Err(MnemoError::ResourceExhausted(format!(
                "free memory {free} MiB below floor {min_free_mb} MiB"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker spawn
// ---------------------------------------------------------------------------

/// Spawn the current executable as a detached background worker with stdio
/// fully redirected. Returns the child's pid. The caller writes the lock
/// with that pid and returns well inside its hook deadline.
pub fn spawn_detached_worker(args: &[String]) -> Result<u32, MnemoError> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe()
        .map_err(|e| MnemoError::Internal(format!("current_exe: {e}")))?;
    let child = Command::new(exe)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| MnemoError::Internal(format!("spawn worker: {e}")))?;
    let pid = child.id();
    info!(pid, ?args, "spawned background worker");
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in(dir: &Path, ttl_secs: u64) -> Lock {
        Lock::new(dir.join("test.lock"), Duration::from_secs(ttl_secs))
    }

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 600);

        let guard = lock.acquire("test").unwrap();
        assert!(lock.path().exists());
        let record = lock.status().unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.owner, "test");

        drop(guard);
        assert!(!lock.path().exists());
    }

    #[test]
    fn second_acquire_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 600);
        let _guard = lock.acquire("first").unwrap();

        // our own pid is alive and the record is fresh
        let err = lock_in(dir.path(), 600).acquire("second").unwrap_err();
        assert!(matches!(err, MnemoError::LockHeld(_)));
    }

    #[test]
    fn stale_record_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 600);
        let stale = LockRecord {
            pid: std::process::id(),
            acquired_at_epoch_ms: now_ms() - 3_600_000,
            owner: "old".into(),
        };
        std::fs::write(lock.path(), serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = lock.acquire("new").unwrap();
        assert_eq!(lock.status().unwrap().owner, "new");
        drop(guard);
    }

    #[test]
    fn dead_pid_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 600);
        // pid 1 is init and always alive; pick one far beyond pid_max instead
        let dead = LockRecord {
            pid: u32::MAX - 1,
            acquired_at_epoch_ms: now_ms(),
            owner: "ghost".into(),
        };
        std::fs::write(lock.path(), serde_json::to_string(&dead).unwrap()).unwrap();

        if cfg!(target_os = "linux") {
            assert!(lock.acquire("new").is_ok());
        }
    }

    #[test]
    fn guard_only_removes_own_record() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 600);
        let guard = lock.acquire("mine").unwrap();

        // another process overwrote the lock (e.g. stale takeover)
        let other = LockRecord {
            pid: std::process::id().wrapping_add(1),
            acquired_at_epoch_ms: now_ms(),
            owner: "other".into(),
        };
        std::fs::write(lock.path(), serde_json::to_string(&other).unwrap()).unwrap();

        drop(guard);
        assert!(lock.path().exists(), "foreign lock must survive our drop");
        std::fs::remove_file(lock.path()).unwrap();
    }

    #[test]
    fn adopt_own_record() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(dir.path(), 600);
        lock.acquire_for_pid("hook", std::process::id()).unwrap();

        let guard = lock.adopt("worker").unwrap();
        drop(guard);
        assert!(!lock.path().exists());
    }

    #[test]
    fn ram_check_passes_with_generous_floor() {
        // zero floor can never fail
        assert!(check_ram(0).is_ok());
    }
}
