// Render sessions: one avatar, one timeline, one clock, at most one viewer.

pub mod manager;
pub mod store;

pub use manager::{AttachGuard, SessionManager};
pub use store::SessionStore;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use visema_core::{FrameGeometry, SessionClock, Timeline};
use visema_render::AvatarImage;

/// Opaque, unguessable session handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// Immutable after creation except for lifecycle bookkeeping.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    avatar: Option<Arc<AvatarImage>>,
    timeline: Timeline,
    geometry: FrameGeometry,
    clock: SessionClock,
    state: Mutex<SessionState>,
    attached: AtomicBool,
    // Some(t) while no transport is attached
    idle_since: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl Session {
    /// The clock starts here, not when a viewer attaches.
    pub fn new(
        id: SessionId,
        avatar: Option<Arc<AvatarImage>>,
        timeline: Timeline,
        geometry: FrameGeometry,
    ) -> Self {
        let clock = SessionClock::start_now();
        Self {
            id,
            avatar,
            timeline,
            geometry,
            clock,
            state: Mutex::new(SessionState::Active),
            attached: AtomicBool::new(false),
            idle_since: Mutex::new(Some(clock.start())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn avatar(&self) -> Option<&Arc<AvatarImage>> {
        self.avatar.as_ref()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn clock(&self) -> SessionClock {
        self.clock
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Fires when the session is stopped or removed.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Claim the single transport slot.
    pub(crate) fn try_attach(&self) -> bool {
        if self.state() != SessionState::Active {
            return false;
        }
        let claimed = self
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            *self.idle_since.lock() = None;
        }
        claimed
    }

    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::Release);
        *self.idle_since.lock() = Some(Instant::now());
    }

    /// Active -> Closing. Returns false if the session was already closing.
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Active {
            return false;
        }
        *state = SessionState::Closing;
        drop(state);
        self.cancel.cancel();
        true
    }

    pub(crate) fn mark_closed(&self) {
        *self.state.lock() = SessionState::Closed;
        self.cancel.cancel();
    }

    /// Unattached for longer than `ttl` as of `now`.
    pub fn is_idle_longer_than(&self, ttl: Duration, now: Instant) -> bool {
        match *self.idle_since.lock() {
            Some(since) => now.saturating_duration_since(since) > ttl,
            None => false,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            state: self.state(),
            attached: self.is_attached(),
            has_avatar: self.avatar.is_some(),
            width: self.geometry.width,
            height: self.geometry.height,
            fps: self.geometry.fps,
            timeline_events: self.timeline.len(),
            elapsed_ms: self.clock.elapsed_ms(),
        }
    }
}

/// Point-in-time view of a session, as served by `GET /render/:id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub state: SessionState,
    pub attached: bool,
    pub has_avatar: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub timeline_events: usize,
    pub elapsed_ms: u64,
}
