//! Upload item data model and state machine
//!
//! A [`TransferItem`] is one outbound transfer: identity, lifecycle state,
//! block progress, timing, retry count and the key material produced along
//! the way.
//!
//! # State Machine
//!
//! ```text
//! Waiting ──request key──> EncodingRequested ──dispatch──> Encoding
//!    ^                                                        │
//!    └──────────────────── key derived ───────────────────────┘
//! Waiting ──dispatch──> Progress ──success/collision──> Done
//!                          │──fatal──> Failed
//!                          └──retryable──> Waiting | Failed (retry cap)
//! ```
//!
//! Entering `Progress` normally resets the finish time and throughput
//! statistics. The one exception is an item restored from storage already in
//! `Progress`: that entry is marked *expected* and keeps its statistics.

use crate::error::{QueueError, Result};
use crate::speed::{BlockRate, SpeedTracker};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Globally unique queue identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(String);

impl QueueId {
    /// Wrap an existing identifier (e.g. one reported by the external queue)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier for a locally queued item
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("haul-{:016x}", rand::random::<u64>()))
    }

    /// Identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Non-owning reference to a shared-source record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedRef(pub u64);

/// Lifecycle state of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    /// Queued, eligible for dispatch
    Waiting,
    /// Key derivation requested, waiting for a worker slot
    EncodingRequested,
    /// Key derivation running
    Encoding,
    /// Transfer running
    Progress,
    /// Transfer finished successfully
    Done,
    /// Transfer failed, needs an explicit restart
    Failed,
}

impl ItemState {
    /// True for states not yet committed to the backend
    #[must_use]
    pub fn is_uncommitted(self) -> bool {
        matches!(self, ItemState::Waiting | ItemState::EncodingRequested)
    }

    /// True while a key derivation is requested or running
    #[must_use]
    pub fn is_encoding(self) -> bool {
        matches!(self, ItemState::EncodingRequested | ItemState::Encoding)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::EncodingRequested => write!(f, "Encoding requested"),
            Self::Encoding => write!(f, "Encoding"),
            Self::Progress => write!(f, "In progress"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Where an item came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemSource {
    /// Queued by this client from a local file
    Local {
        /// Backing file
        path: PathBuf,
    },
    /// Entry of the external persistent queue this client did not originate
    External,
}

/// Enable/disable request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    /// Enable
    On,
    /// Disable
    Off,
    /// Flip the current value
    Invert,
}

/// User-supplied 32-byte crypto key
///
/// Only ever held as 32 raw bytes and rendered as 64 lowercase hex
/// characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CryptoKey([u8; 32]);

impl CryptoKey {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for CryptoKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(QueueError::InvalidKey(Cow::Owned(format!(
                "expected 64 hex characters, got {}",
                s.len()
            ))));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(QueueError::InvalidKey(Cow::Borrowed(
                "only lowercase hex characters are allowed",
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| QueueError::InvalidKey(Cow::Owned(e.to_string())))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for CryptoKey {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CryptoKey> for String {
    fn from(key: CryptoKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoKey({}..)", &hex::encode(&self.0[..4]))
    }
}

/// Transport compatibility mode tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompatMode(String);

impl CompatMode {
    /// Tag as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Set of compatibility modes the backend currently understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatModes {
    known: Vec<String>,
    default: String,
}

impl CompatModes {
    /// Default mode tag
    pub const DEFAULT_MODE: &'static str = "COMPAT_CURRENT";

    /// Build a mode set; the default is added to the known set if missing
    pub fn new(known: Vec<String>, default: impl Into<String>) -> Self {
        let default = default.into();
        let mut known = known;
        if !known.contains(&default) {
            known.push(default.clone());
        }
        Self { known, default }
    }

    /// Resolve a tag; unknown or legacy tags fall back to the default
    #[must_use]
    pub fn resolve(&self, tag: &str) -> CompatMode {
        if self.known.iter().any(|k| k == tag) {
            CompatMode(tag.to_string())
        } else {
            CompatMode(self.default.clone())
        }
    }

    /// The default mode
    #[must_use]
    pub fn default_mode(&self) -> CompatMode {
        CompatMode(self.default.clone())
    }

    /// All known tags
    #[must_use]
    pub fn known(&self) -> &[String] {
        &self.known
    }
}

impl Default for CompatModes {
    fn default() -> Self {
        Self::new(
            vec![
                "COMPAT_1255".to_string(),
                "COMPAT_1416".to_string(),
                "COMPAT_1468".to_string(),
            ],
            Self::DEFAULT_MODE,
        )
    }
}

/// Priority class, 0 is the most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Most urgent class
    pub const HIGHEST: Priority = Priority(0);
    /// Class used for new items
    pub const DEFAULT: Priority = Priority(3);
    /// Least urgent class
    pub const LOWEST: Priority = Priority(6);

    /// Build a priority, rejecting classes outside 0..=6
    #[must_use]
    pub fn new(class: u8) -> Option<Self> {
        (class <= Self::LOWEST.0).then_some(Self(class))
    }

    /// Numeric class
    #[must_use]
    pub fn class(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(class: u8) -> Result<Self> {
        Priority::new(class).ok_or_else(|| {
            QueueError::InvalidConfig(Cow::Owned(format!("priority class {class} out of range")))
        })
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

/// One outbound transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    queue_id: QueueId,
    source: ItemSource,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name_prefix: Option<String>,
    file_size: u64,
    state: ItemState,

    total_units: Option<u64>,
    done_units: Option<u64>,
    finalized: Option<bool>,

    added_at: u64,
    #[serde(default)]
    started_at: u64,
    #[serde(default)]
    finished_at: u64,
    #[serde(default)]
    last_stopped_at: u64,
    #[serde(default)]
    retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    crypto_key: Option<CryptoKey>,

    enabled: bool,
    compress: bool,
    compat_mode: CompatMode,
    #[serde(default)]
    priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shared_ref: Option<SharedRef>,
    #[serde(default)]
    logged: bool,
    #[serde(default)]
    hook_ran: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,

    #[serde(skip)]
    removal_expected: bool,
    #[serde(skip)]
    progress_expected: bool,
    #[serde(skip)]
    speed: Option<SpeedTracker>,
}

impl TransferItem {
    /// Create a freshly queued item for a local file
    #[must_use]
    pub fn new_local(
        path: impl Into<PathBuf>,
        file_size: u64,
        compress: bool,
        compat_mode: CompatMode,
        now: u64,
    ) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self::new(
            QueueId::generate(),
            ItemSource::Local { path },
            name,
            file_size,
            compress,
            compat_mode,
            now,
        )
    }

    /// Create an item mirroring an entry of the external persistent queue
    #[must_use]
    pub fn new_external(
        queue_id: QueueId,
        name: impl Into<String>,
        file_size: u64,
        compat_mode: CompatMode,
        now: u64,
    ) -> Self {
        Self::new(
            queue_id,
            ItemSource::External,
            name.into(),
            file_size,
            false,
            compat_mode,
            now,
        )
    }

    fn new(
        queue_id: QueueId,
        source: ItemSource,
        name: String,
        file_size: u64,
        compress: bool,
        compat_mode: CompatMode,
        now: u64,
    ) -> Self {
        Self {
            queue_id,
            source,
            name,
            name_prefix: None,
            file_size,
            state: ItemState::Waiting,
            total_units: None,
            done_units: None,
            finalized: None,
            added_at: now,
            started_at: 0,
            finished_at: 0,
            last_stopped_at: 0,
            retries: 0,
            content_id: None,
            crypto_key: None,
            enabled: true,
            compress,
            compat_mode,
            priority: Priority::DEFAULT,
            shared_ref: None,
            logged: false,
            hook_ran: false,
            error_description: None,
            removal_expected: false,
            progress_expected: false,
            speed: None,
        }
    }

    /// Set the user-supplied crypto key
    #[must_use]
    pub fn with_crypto_key(mut self, key: CryptoKey) -> Self {
        self.crypto_key = Some(key);
        self
    }

    /// Set a prefix prepended to the published name
    #[must_use]
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Link the item to a shared-source record
    #[must_use]
    pub fn with_shared_ref(mut self, shared: SharedRef) -> Self {
        self.shared_ref = Some(shared);
        self
    }

    /// Set the priority class
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    // ---- identity ----

    /// Queue identifier
    #[must_use]
    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// Backing file of a local item
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            ItemSource::Local { path } => Some(path),
            ItemSource::External => None,
        }
    }

    /// True if the item mirrors an external queue entry
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self.source, ItemSource::External)
    }

    /// Display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name published to the backend, including the prefix if any
    #[must_use]
    pub fn published_name(&self) -> String {
        match &self.name_prefix {
            Some(prefix) => format!("{prefix}{}", self.name),
            None => self.name.clone(),
        }
    }

    /// File size in bytes
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Compression flag, fixed at creation
    #[must_use]
    pub fn compress(&self) -> bool {
        self.compress
    }

    /// Compatibility mode
    #[must_use]
    pub fn compat_mode(&self) -> &CompatMode {
        &self.compat_mode
    }

    /// Re-resolve the compatibility mode against the known set
    pub fn resolve_compat_mode(&mut self, modes: &CompatModes) {
        self.compat_mode = modes.resolve(self.compat_mode.as_str());
    }

    /// Priority class
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Change the priority class
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Linked shared-source record
    #[must_use]
    pub fn shared_ref(&self) -> Option<SharedRef> {
        self.shared_ref
    }

    /// Link this item to a shared-source record
    pub fn link_shared(&mut self, shared: SharedRef) {
        self.shared_ref = Some(shared);
    }

    // ---- state ----

    /// Current state
    #[must_use]
    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Move to `state`
    ///
    /// A genuine entry into `Progress` resets the finish time and throughput
    /// statistics and stamps the start time. An expected entry (restored
    /// from storage) leaves them untouched.
    pub fn set_state(&mut self, state: ItemState, now: u64) {
        if state == ItemState::Progress {
            if self.progress_expected {
                self.progress_expected = false;
            } else {
                self.finished_at = 0;
                self.started_at = now;
                if let Some(speed) = self.speed.as_mut() {
                    speed.reset();
                }
            }
        }
        self.state = state;
    }

    /// Adjust an item just loaded from storage
    ///
    /// A running derivation did not survive the restart and is requested
    /// again. A running transfer either resumes (when the persistent queue
    /// kept it) or is demoted to `Waiting`.
    pub fn rehydrate(&mut self, keep_in_progress: bool, now: u64) {
        match self.state {
            ItemState::Encoding => self.state = ItemState::EncodingRequested,
            ItemState::Progress if keep_in_progress || self.is_external() => {
                self.progress_expected = true;
                self.set_state(ItemState::Progress, now);
            }
            ItemState::Progress => self.state = ItemState::Waiting,
            _ => {}
        }
    }

    /// Reset all run fields for a restart
    ///
    /// Identity, key material and a pending removal-expected flag survive;
    /// the flag is consumed by the dequeue notification it anticipates.
    pub fn reset_for_restart(&mut self) {
        self.state = ItemState::Waiting;
        self.total_units = None;
        self.done_units = None;
        self.finalized = None;
        self.started_at = 0;
        self.finished_at = 0;
        self.last_stopped_at = 0;
        self.retries = 0;
        self.enabled = true;
        self.logged = false;
        self.hook_ran = false;
        self.error_description = None;
        self.progress_expected = false;
        self.speed = None;
    }

    // ---- progress ----

    /// Update block progress
    ///
    /// `done` is clamped to `total` when both are known.
    pub fn update_progress(
        &mut self,
        done: Option<u64>,
        total: Option<u64>,
        finalized: Option<bool>,
        now: u64,
    ) {
        self.total_units = total;
        self.finalized = finalized;
        self.set_done_units(done, now);
    }

    /// Update the done-unit count
    ///
    /// The activity timestamp moves before the throughput counter so that
    /// the first non-zero count arms stall detection.
    pub fn set_done_units(&mut self, done: Option<u64>, now: u64) {
        let done = match (done, self.total_units) {
            (Some(d), Some(t)) => Some(d.min(t)),
            (d, _) => d,
        };
        self.done_units = done;
        if let Some(d) = done {
            self.speed.get_or_insert_with(SpeedTracker::new).record(d, now);
        }
    }

    /// Total blocks, if known
    #[must_use]
    pub fn total_units(&self) -> Option<u64> {
        self.total_units
    }

    /// Done blocks, if known
    #[must_use]
    pub fn done_units(&self) -> Option<u64> {
        self.done_units
    }

    /// Whether the counters refer to the main payload
    #[must_use]
    pub fn finalized(&self) -> Option<bool> {
        self.finalized
    }

    /// Blocks still to transfer, if progress has started
    #[must_use]
    pub fn remaining_units(&self) -> Option<u64> {
        match (self.total_units, self.done_units) {
            (Some(total), Some(done)) if total > 0 => Some(total.saturating_sub(done)),
            _ => None,
        }
    }

    /// Percent done, clamped at 100
    #[must_use]
    pub fn percent_done(&self) -> Option<f64> {
        match (self.total_units, self.done_units) {
            (Some(total), Some(done)) if total > 0 => {
                Some((done as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }

    /// Average block rate
    #[must_use]
    pub fn block_rate(&self, now: u64) -> BlockRate {
        self.speed
            .as_ref()
            .map_or(BlockRate::Measuring, |s| s.block_rate(now))
    }

    /// Average bytes per second
    #[must_use]
    pub fn bytes_per_second(&self, now: u64) -> Option<f64> {
        self.speed.as_ref()?.bytes_per_second(now)
    }

    /// Milliseconds since the last observed progress
    #[must_use]
    pub fn since_last_activity(&self, now: u64) -> Option<u64> {
        self.speed.as_ref()?.since_last_activity(now)
    }

    /// Estimated time remaining
    #[must_use]
    pub fn eta(&self, now: u64) -> Option<Duration> {
        self.speed.as_ref()?.eta(self.remaining_units()?, now)
    }

    // ---- timing ----

    /// When the item was queued
    #[must_use]
    pub fn added_at(&self) -> u64 {
        self.added_at
    }

    /// When the current transfer started (0 = never)
    #[must_use]
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    /// When the item finished (0 = not finished)
    #[must_use]
    pub fn finished_at(&self) -> u64 {
        self.finished_at
    }

    /// Stamp the finish time
    pub fn set_finished_at(&mut self, now: u64) {
        self.finished_at = now;
    }

    /// When the last attempt stopped (0 = never)
    #[must_use]
    pub fn last_stopped_at(&self) -> u64 {
        self.last_stopped_at
    }

    /// Stamp the end of an attempt
    pub fn set_last_stopped_at(&mut self, now: u64) {
        self.last_stopped_at = now;
    }

    /// Number of retryable failures so far
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Count one more retryable failure and return the new count
    pub fn increment_retries(&mut self) -> u32 {
        self.retries = self.retries.saturating_add(1);
        self.retries
    }

    // ---- key material ----

    /// Content identifier, once known
    #[must_use]
    pub fn content_id(&self) -> Option<&str> {
        self.content_id.as_deref()
    }

    /// Record the content identifier
    pub fn set_content_id(&mut self, id: impl Into<String>) {
        self.content_id = Some(id.into());
    }

    /// User-supplied crypto key
    #[must_use]
    pub fn crypto_key(&self) -> Option<&CryptoKey> {
        self.crypto_key.as_ref()
    }

    // ---- flags ----

    /// Whether the scheduler may start this item
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Apply an enable/disable request and return the new value
    pub fn set_enabled(&mut self, toggle: Toggle) -> bool {
        self.enabled = match toggle {
            Toggle::On => true,
            Toggle::Off => false,
            Toggle::Invert => !self.enabled,
        };
        self.enabled
    }

    /// Whether a dequeue from the external queue was requested on purpose
    #[must_use]
    pub fn is_removal_expected(&self) -> bool {
        self.removal_expected
    }

    /// Flag the upcoming dequeue notification as intentional
    pub fn mark_removal_expected(&mut self) {
        self.removal_expected = true;
    }

    /// Consume the removal-expected flag
    pub fn take_removal_expected(&mut self) -> bool {
        std::mem::take(&mut self.removal_expected)
    }

    /// Flag the completion as logged; returns false if it already was
    pub fn mark_logged(&mut self) -> bool {
        !std::mem::replace(&mut self.logged, true)
    }

    /// Flag the completion hook as run; returns false if it already was
    pub fn mark_hook_ran(&mut self) -> bool {
        !std::mem::replace(&mut self.hook_ran, true)
    }

    /// Last error description
    #[must_use]
    pub fn error_description(&self) -> Option<&str> {
        self.error_description.as_deref()
    }

    /// Attach an error description
    pub fn set_error(&mut self, description: impl Into<String>) {
        self.error_description = Some(description.into());
    }

    /// Clear the error description
    pub fn clear_error(&mut self) {
        self.error_description = None;
    }
}
