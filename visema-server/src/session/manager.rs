// Session lifecycle: creation, attach/detach, stop, and idle reaping.

use super::{Session, SessionId, SessionInfo, SessionStore};
use crate::assets::AssetStore;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use visema_core::{Error, FrameGeometry, RenderConfig, Result, Timeline};
use visema_render::AvatarImage;

const MAX_AVATAR_REF_LEN: usize = 1024;

type AvatarKey = (String, u32, u32);

pub struct SessionManager {
    store: Arc<SessionStore>,
    assets: Option<Arc<dyn AssetStore>>,
    // None when caching is disabled
    avatar_cache: Option<Mutex<LruCache<AvatarKey, Arc<AvatarImage>>>>,
    session_ttl: Duration,
}

impl SessionManager {
    pub fn new(
        assets: Option<Arc<dyn AssetStore>>,
        avatar_cache_size: usize,
        session_ttl: Duration,
    ) -> Self {
        Self {
            store: Arc::new(SessionStore::new()),
            assets,
            avatar_cache: NonZeroUsize::new(avatar_cache_size).map(|n| Mutex::new(LruCache::new(n))),
            session_ttl,
        }
    }

    pub fn from_config(config: &RenderConfig, assets: Option<Arc<dyn AssetStore>>) -> Self {
        Self::new(assets, config.avatar_cache_size, config.session_ttl())
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Create a session and start its clock.
    ///
    /// Dimensions and frame rate are clamped into range. A missing or
    /// undecodable avatar is not an error: the session renders the
    /// placeholder background instead.
    pub async fn start_session(
        &self,
        avatar_ref: &str,
        timeline: Timeline,
        width: i64,
        height: i64,
        fps: i64,
    ) -> Result<SessionId> {
        if avatar_ref.len() > MAX_AVATAR_REF_LEN {
            return Err(Error::Validation("avatar reference too long".to_string()));
        }
        if avatar_ref.chars().any(|c| c.is_control()) {
            return Err(Error::Validation(
                "avatar reference contains control characters".to_string(),
            ));
        }
        let geometry = FrameGeometry::clamped(width, height, fps)?;

        // fetch before registering, so the clock starts once the session is complete
        let avatar = self.load_avatar(avatar_ref, geometry).await;

        let session = Session::new(SessionId::new(), avatar, timeline, geometry);
        let session = self.store.register(session)?;
        info!(
            session_id = %session.id(),
            width = geometry.width,
            height = geometry.height,
            fps = geometry.fps,
            events = session.timeline().len(),
            avatar = session.avatar().is_some(),
            "session started"
        );
        Ok(session.id().clone())
    }

    async fn load_avatar(
        &self,
        avatar_ref: &str,
        geometry: FrameGeometry,
    ) -> Option<Arc<AvatarImage>> {
        if avatar_ref.is_empty() {
            return None;
        }
        let Some(assets) = &self.assets else {
            debug!(avatar_ref, "no asset store configured, using placeholder");
            return None;
        };

        let key = (avatar_ref.to_string(), geometry.width, geometry.height);
        if let Some(cache) = &self.avatar_cache {
            if let Some(hit) = cache.lock().get(&key) {
                return Some(Arc::clone(hit));
            }
        }

        match fetch_avatar(assets.as_ref(), avatar_ref, geometry).await {
            Ok(avatar) => {
                let avatar = Arc::new(avatar);
                if let Some(cache) = &self.avatar_cache {
                    cache.lock().put(key, Arc::clone(&avatar));
                }
                Some(avatar)
            }
            Err(e) => {
                warn!(avatar_ref, store = assets.name(), error = %e, "avatar unavailable, using placeholder");
                None
            }
        }
    }

    /// Stop a session. Unknown or already-stopped ids are a no-op.
    pub fn stop_session(&self, id: &str) {
        if self.store.close(&SessionId::from(id)) {
            info!(session_id = id, "session stopped");
        }
    }

    /// Claim the session's single transport slot.
    ///
    /// Dropping the returned guard detaches and removes the session.
    pub fn attach(&self, id: &str) -> Result<AttachGuard> {
        let id = SessionId::from(id);
        let session = self
            .store
            .get(&id)
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;

        if !session.try_attach() {
            if session.state() != super::SessionState::Active {
                return Err(Error::UnknownSession(id.to_string()));
            }
            return Err(Error::DoubleAttach(id.to_string()));
        }

        debug!(session_id = %id, "transport attached");
        Ok(AttachGuard {
            store: Arc::clone(&self.store),
            session: Arc::downgrade(&session),
            id,
        })
    }

    pub fn session_info(&self, id: &str) -> Result<SessionInfo> {
        self.store
            .get(&SessionId::from(id))
            .map(|s| s.info())
            .ok_or_else(|| Error::UnknownSession(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Remove sessions that were never attached (or were detached) for longer than the TTL.
    pub fn reap_idle(&self) -> Vec<SessionId> {
        self.store.reap_idle(self.session_ttl, Instant::now())
    }

    /// Run `reap_idle` every `interval` until the task is aborted.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                let reaped = manager.reap_idle();
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "reaped idle sessions");
                }
            }
        })
    }

    /// Close every session, ending all draw loops.
    pub fn shutdown(&self) {
        let closed = self.store.close_all();
        info!(sessions = closed, "closed all sessions");
    }
}

async fn fetch_avatar(
    assets: &dyn AssetStore,
    avatar_ref: &str,
    geometry: FrameGeometry,
) -> Result<AvatarImage> {
    let bytes = assets.get(avatar_ref).await?;
    let (width, height) = (geometry.width, geometry.height);
    tokio::task::spawn_blocking(move || AvatarImage::decode(&bytes, width, height))
        .await
        .map_err(|e| Error::Internal(format!("avatar decode task failed: {}", e)))?
        .map_err(Error::from)
}

/// Exclusive claim on a session's transport slot.
#[derive(Debug)]
pub struct AttachGuard {
    store: Arc<SessionStore>,
    session: Weak<Session>,
    id: SessionId,
}

impl AttachGuard {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Non-owning handle; the draw loop must not keep a removed session alive.
    pub fn session(&self) -> Weak<Session> {
        Weak::clone(&self.session)
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.detach();
        }
        if self.store.close(&self.id) {
            debug!(session_id = %self.id, "session removed after transport detached");
        }
    }
}
