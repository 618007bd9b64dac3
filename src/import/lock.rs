// Import lock
// One import at a time across every process sharing the settings store.
// Advisory: a record with a TTL, cleared on release or lazily once expired.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{human_duration, Clock};
use crate::constants::{DEFAULT_LOCK_TTL_SECONDS, IMPORT_LOCK_KEY, LOCK_TIME_FORMAT, UNKNOWN_LOCK_SOURCE};
use crate::error::{DocrateError, Result};
use crate::settings::SettingsStore;

fn unknown_source() -> String {
    UNKNOWN_LOCK_SOURCE.to_string()
}

/// Stored lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    #[serde(default = "unknown_source")]
    pub source: String,
    /// Unix seconds.
    pub acquired_at: i64,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub token: String,
}

impl LockInfo {
    pub fn started(&self) -> String {
        format_unix(self.acquired_at)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatusInfo {
    pub locked: bool,
    pub source: Option<String>,
    pub started: Option<String>,
    pub running_for_seconds: Option<i64>,
    pub owner_id: Option<String>,
    pub message: String,
}

/// Process identity, `hostname:pid`.
pub fn owner_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

fn format_unix(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|ts| ts.format(LOCK_TIME_FORMAT).to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// A lock handle. Each handle carries its own token, so only the handle that
/// wrote a record can release it.
pub struct ImportLock<'a> {
    store: &'a dyn SettingsStore,
    clock: &'a dyn Clock,
    ttl_seconds: i64,
    owner_id: String,
    token: String,
}

impl<'a> ImportLock<'a> {
    pub fn new(store: &'a dyn SettingsStore, clock: &'a dyn Clock) -> Self {
        Self {
            store,
            clock,
            ttl_seconds: DEFAULT_LOCK_TTL_SECONDS,
            owner_id: owner_id(),
            token: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds.max(1);
        self
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    fn age(&self, lock: &LockInfo) -> i64 {
        (self.now() - lock.acquired_at).max(0)
    }

    fn is_live(&self, lock: &LockInfo) -> bool {
        self.now() - lock.acquired_at < self.ttl_seconds
    }

    /// Raw record plus its parsed form. Unreadable records parse to `None`.
    fn read(&self) -> Result<(Option<String>, Option<LockInfo>)> {
        let raw = self.store.get(IMPORT_LOCK_KEY)?;
        let parsed = raw.as_deref().and_then(|r| match serde_json::from_str::<LockInfo>(r) {
            Ok(lock) => Some(lock),
            Err(e) => {
                log::warn!("Ignoring unreadable import lock record: {}", e);
                None
            }
        });
        Ok((raw, parsed))
    }

    /// Delete the record only if it is still `raw`.
    fn delete_if_unchanged(&self, raw: &str) -> Result<bool> {
        match self.store.compare_and_delete(IMPORT_LOCK_KEY, raw)? {
            Some(deleted) => Ok(deleted),
            None => self.store.delete(IMPORT_LOCK_KEY),
        }
    }

    pub fn acquire(&self, source: &str) -> Result<LockInfo> {
        let (raw, existing) = self.read()?;

        if let Some(lock) = existing.as_ref().filter(|l| self.is_live(l)) {
            return Err(DocrateError::AlreadyLocked {
                message: format!(
                    "Import already running since {} (source: {}), started {} ago. Please wait.",
                    lock.started(),
                    lock.source,
                    human_duration(self.age(lock))
                ),
            });
        }

        let record = LockInfo {
            source: source.to_string(),
            acquired_at: self.now(),
            owner_id: self.owner_id.clone(),
            token: self.token.clone(),
        };
        let value = serde_json::to_string(&record)?;

        match self.store.compare_and_swap(IMPORT_LOCK_KEY, raw.as_deref(), &value)? {
            Some(true) => {}
            Some(false) => {
                return Err(DocrateError::LockFailed(
                    "another process acquired the lock first".to_string(),
                ));
            }
            None => {
                // No conditional write: write, then confirm the record is ours
                self.store.set(IMPORT_LOCK_KEY, &value)?;
                let (_, verify) = self.read()?;
                if verify.map(|v| v.token) != Some(self.token.clone()) {
                    return Err(DocrateError::LockFailed(
                        "lock record was overwritten by another process".to_string(),
                    ));
                }
            }
        }

        log::info!("Import lock acquired for {} by {}", record.source, record.owner_id);
        Ok(record)
    }

    /// Acquire and return a guard that releases on drop, so the lock is
    /// given back even when the holder unwinds.
    pub fn hold(&self, source: &str) -> Result<HeldLock<'_, 'a>> {
        let info = self.acquire(source)?;
        Ok(HeldLock { lock: self, info })
    }

    /// Release a lock written by this handle. Returns whether a record was removed.
    pub fn release(&self) -> Result<bool> {
        let (raw, existing) = self.read()?;
        let (Some(raw), Some(lock)) = (raw, existing) else {
            return Ok(false);
        };

        if lock.token != self.token {
            log::debug!("Not releasing import lock held by {}", lock.owner_id);
            return Ok(false);
        }

        let deleted = self.delete_if_unchanged(&raw)?;
        if deleted {
            log::info!("Import lock released for {}", lock.source);
        }
        Ok(deleted)
    }

    /// Live lock, if any. An expired record is removed on read.
    pub fn is_locked(&self) -> Result<Option<LockInfo>> {
        let (raw, existing) = self.read()?;
        let (Some(raw), Some(lock)) = (raw, existing) else {
            return Ok(None);
        };

        if self.is_live(&lock) {
            return Ok(Some(lock));
        }

        if self.delete_if_unchanged(&raw)? {
            log::info!(
                "Cleared expired import lock for {} (held {})",
                lock.source,
                human_duration(self.age(&lock))
            );
        }
        Ok(None)
    }

    /// Remove whatever lock record exists. Administrative escape hatch.
    pub fn force_release(&self) -> Result<bool> {
        let (_, existing) = self.read()?;
        let deleted = self.store.delete(IMPORT_LOCK_KEY)?;
        if deleted {
            log::warn!(
                "Import lock force released (was held by {})",
                existing.map(|l| format!("{} for {}", l.owner_id, l.source))
                    .unwrap_or_else(|| "an unreadable record".to_string())
            );
        }
        Ok(deleted)
    }

    pub fn status(&self) -> Result<LockStatusInfo> {
        let Some(lock) = self.is_locked()? else {
            return Ok(LockStatusInfo {
                locked: false,
                source: None,
                started: None,
                running_for_seconds: None,
                owner_id: None,
                message: "No active import".to_string(),
            });
        };

        let running_for = self.age(&lock);
        Ok(LockStatusInfo {
            locked: true,
            message: format!(
                "Import running from {} (started {} ago)",
                lock.source,
                human_duration(running_for)
            ),
            started: Some(lock.started()),
            running_for_seconds: Some(running_for),
            owner_id: Some(lock.owner_id),
            source: Some(lock.source),
        })
    }
}

/// A lock acquired through [`ImportLock::hold`].
pub struct HeldLock<'l, 'a> {
    lock: &'l ImportLock<'a>,
    info: LockInfo,
}

impl HeldLock<'_, '_> {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for HeldLock<'_, '_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log::warn!("Releasing import lock for {} while unwinding", self.info.source);
        }
        if let Err(e) = self.lock.release() {
            log::error!("Failed to release import lock: {}", e);
        }
    }
}
