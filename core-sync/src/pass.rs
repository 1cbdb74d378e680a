//! # Sync Pass State Machine
//!
//! One upload/download/verify cycle with validated phase transitions.
//!
//! ## State Machine
//!
//! ```text
//! Idle → Uploading → Downloading → Verifying → Complete
//!            ↓             ↓            ↓
//!            └──────→ Failed / Cancelled ←┘
//! ```
//!
//! Terminal phases (`Complete`, `Failed`, `Cancelled`) may only move back to
//! `Uploading`, which is how the engine-wide phase starts the next pass.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// ID Types
// ============================================================================

/// Unique identifier for a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncPassId(Uuid);

impl SyncPassId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for SyncPassId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncPassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Phase
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Uploading,
    Downloading,
    Verifying,
    Complete,
    Failed,
    Cancelled,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Uploading => "uploading",
            SyncPhase::Downloading => "downloading",
            SyncPhase::Verifying => "verifying",
            SyncPhase::Complete => "complete",
            SyncPhase::Failed => "failed",
            SyncPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncPhase::Complete | SyncPhase::Failed | SyncPhase::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncPhase::Uploading | SyncPhase::Downloading | SyncPhase::Verifying
        )
    }

    pub fn can_transition_to(&self, to: SyncPhase) -> bool {
        match (self, to) {
            (SyncPhase::Idle, SyncPhase::Uploading) => true,
            (from, SyncPhase::Uploading) if from.is_terminal() => true,

            (SyncPhase::Uploading, SyncPhase::Downloading) => true,
            (SyncPhase::Downloading, SyncPhase::Verifying) => true,
            (SyncPhase::Verifying, SyncPhase::Complete) => true,

            (from, SyncPhase::Failed | SyncPhase::Cancelled) => from.is_active(),

            _ => false,
        }
    }

    /// Check a transition, naming both ends on failure.
    pub fn validate_transition(&self, to: SyncPhase) -> Result<()> {
        if self.can_transition_to(to) {
            return Ok(());
        }

        Err(SyncError::InvalidStateTransition {
            from: self.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: format!("Cannot transition from {} to {}", self, to),
        })
    }
}

impl FromStr for SyncPhase {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(SyncPhase::Idle),
            "uploading" => Ok(SyncPhase::Uploading),
            "downloading" => Ok(SyncPhase::Downloading),
            "verifying" => Ok(SyncPhase::Verifying),
            "complete" => Ok(SyncPhase::Complete),
            "failed" => Ok(SyncPhase::Failed),
            "cancelled" => Ok(SyncPhase::Cancelled),
            other => Err(SyncError::invalid_input(
                "phase",
                format!("unknown sync phase '{}'", other),
            )),
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Progress and Result Types
// ============================================================================

/// Progress report handed to the `on_progress` callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub pass_id: SyncPassId,
    /// `upload`, `download`, `verify` or `complete`
    pub phase: String,
    pub processed: u64,
    pub total: Option<u64>,
    /// 0-100, only meaningful when `total` is known
    pub percent: u8,
}

impl SyncProgress {
    pub fn new(pass_id: SyncPassId, phase: &str, processed: u64, total: Option<u64>) -> Self {
        let percent = match total {
            Some(total) if total > 0 => ((processed as f64 / total as f64) * 100.0).min(100.0) as u8,
            Some(_) => 100,
            None => 0,
        };

        Self {
            pass_id,
            phase: phase.to_string(),
            processed,
            total,
            percent,
        }
    }
}

/// Outcome of [`SyncOrchestrator::sync`](crate::SyncOrchestrator::sync)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub uploaded: u64,
    pub downloaded: u64,
    pub conflicts: u64,
    pub errors: Vec<String>,
    /// Unix millis when the pass finished
    pub timestamp: i64,
}

impl SyncResult {
    /// A pass that never started
    pub fn rejected(message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            success: false,
            uploaded: 0,
            downloaded: 0,
            conflicts: 0,
            errors: vec![message.into()],
            timestamp,
        }
    }
}

// ============================================================================
// Pass Tracker
// ============================================================================

/// Bookkeeping for one running pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPass {
    pub id: SyncPassId,
    pub phase: SyncPhase,
    pub trigger: String,
    pub forced: bool,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub conflicts: u64,
    /// Non-fatal problems collected along the way
    pub errors: Vec<String>,
}

impl SyncPass {
    pub fn new(trigger: impl Into<String>, forced: bool, started_at: i64) -> Self {
        Self {
            id: SyncPassId::new(),
            phase: SyncPhase::Idle,
            trigger: trigger.into(),
            forced,
            started_at,
            finished_at: None,
            uploaded: 0,
            downloaded: 0,
            conflicts: 0,
            errors: Vec::new(),
        }
    }

    /// Move to `to`; terminal phases stamp `finished_at`.
    pub fn transition(&mut self, to: SyncPhase, now: i64) -> Result<()> {
        self.phase.validate_transition(to)?;
        self.phase = to;
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| end.saturating_sub(self.started_at).max(0) as u64)
    }

    pub fn into_result(self) -> SyncResult {
        SyncResult {
            success: self.phase == SyncPhase::Complete,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            conflicts: self.conflicts,
            timestamp: self.finished_at.unwrap_or(self.started_at),
            errors: self.errors,
        }
    }
}
