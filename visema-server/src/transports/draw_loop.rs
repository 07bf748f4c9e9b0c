// Per-session draw loop.
//
// Each tick: look up the current viseme at `now - start`, render off the async
// workers, hand the frame to the transport with the next tick as deadline, then
// sleep until that tick. Ticks that were missed are skipped.

use super::{Delivery, LoopReport, StopReason, StreamTransport};
use crate::session::{AttachGuard, Session, SessionState};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use visema_core::clock::millis;
use visema_core::{category_to_openness, DropPolicy, Error, RenderConfig, Result};
use visema_render::{AvatarImage, Frame, FrameCompositor, FrameMeta};

#[derive(Debug, Clone)]
pub struct DrawLoopOptions {
    pub compositor: FrameCompositor,
    pub drop_policy: DropPolicy,
    pub drop_report_every: u64,
}

impl Default for DrawLoopOptions {
    fn default() -> Self {
        Self {
            compositor: FrameCompositor::default(),
            drop_policy: DropPolicy::Silent,
            drop_report_every: 30,
        }
    }
}

impl DrawLoopOptions {
    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            compositor: FrameCompositor::default(),
            drop_policy: config.drop_policy,
            drop_report_every: config.drop_report_every.max(1),
        }
    }
}

/// Run a draw loop for an attached session on its own task.
///
/// The session is torn down when the loop ends for any reason, including a
/// panic inside the loop.
pub fn spawn_stream<T>(guard: AttachGuard, transport: T, options: DrawLoopOptions) -> JoinHandle<LoopReport>
where
    T: StreamTransport + 'static,
{
    tokio::spawn(async move {
        let kind = transport.kind();
        let run = run_draw_loop(guard.session(), transport, options);
        let report = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(report) => report,
            Err(_) => {
                error!(session_id = %guard.id(), transport = %kind, "draw loop panicked");
                LoopReport::ended(StopReason::Panicked)
            }
        };

        info!(
            session_id = %guard.id(),
            transport = %kind,
            frames_sent = report.frames_sent,
            frames_dropped = report.frames_dropped,
            reason = %report.reason,
            "stream ended"
        );
        drop(guard);
        report
    })
}

/// What the loop needs from the session, copied out once so that the loop
/// holds no strong reference between ticks.
struct Scene {
    avatar: Option<Arc<AvatarImage>>,
    timeline: visema_core::Timeline,
    geometry: visema_core::FrameGeometry,
    clock: visema_core::SessionClock,
}

impl Scene {
    fn of(session: &Session) -> Self {
        Self {
            avatar: session.avatar().cloned(),
            timeline: session.timeline().clone(),
            geometry: session.geometry(),
            clock: session.clock(),
        }
    }
}

pub async fn run_draw_loop<T: StreamTransport>(
    session: Weak<Session>,
    mut transport: T,
    options: DrawLoopOptions,
) -> LoopReport {
    let Some((scene, cancel, id)) = session
        .upgrade()
        .map(|s| (Scene::of(&s), s.cancellation(), s.id().clone()))
    else {
        transport.finish(StopReason::Removed).await;
        return LoopReport::ended(StopReason::Removed);
    };

    let fps = scene.geometry.fps;
    let mut report = LoopReport::ended(StopReason::Stopped);
    let mut index = 0u64;

    let reason = loop {
        match session.upgrade() {
            None => break StopReason::Removed,
            Some(s) if s.state() != SessionState::Active => break StopReason::Stopped,
            Some(_) => {}
        }

        let now = Instant::now();
        let deadline = scene.clock.tick_deadline(scene.clock.next_tick_after(now, fps), fps);
        let frame = match render(&scene, &options.compositor, scene.clock.elapsed_at(now), index).await {
            Ok(frame) => frame,
            Err(e) => {
                error!(session_id = %id, error = %e, "render failed");
                break StopReason::Panicked;
            }
        };
        index += 1;

        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Stopped,
            delivery = transport.deliver(frame, deadline) => delivery,
        };
        match delivery {
            Ok(Delivery::Sent) => report.frames_sent += 1,
            Ok(Delivery::Dropped) => {
                report.frames_dropped += 1;
                if options.drop_policy == DropPolicy::Report
                    && report.frames_dropped % options.drop_report_every.max(1) == 0
                {
                    warn!(
                        session_id = %id,
                        dropped = report.frames_dropped,
                        sent = report.frames_sent,
                        "consumer too slow, dropping frames"
                    );
                }
            }
            Ok(Delivery::Closed) => break StopReason::Disconnected,
            Err(e) => {
                warn!(session_id = %id, error = %e, "frame delivery failed");
                break StopReason::TransportFailure;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Stopped,
            _ = transport.closed() => break StopReason::Disconnected,
            _ = tokio::time::sleep_until(deadline) => {}
        }
    };

    debug!(session_id = %id, reason = %reason, "draw loop exiting");
    transport.finish(reason).await;
    report.reason = reason;
    report
}

async fn render(
    scene: &Scene,
    compositor: &FrameCompositor,
    elapsed: Duration,
    index: u64,
) -> Result<Frame> {
    let elapsed_ms = millis(elapsed);
    let category = scene.timeline.category_at(elapsed_ms).to_string();
    let meta = FrameMeta {
        index,
        elapsed_ms,
        openness: category_to_openness(&category),
        category,
    };

    let compositor = compositor.clone();
    let avatar = scene.avatar.clone();
    let (width, height) = (scene.geometry.width, scene.geometry.height);
    let label = meta.category.clone();
    let image = tokio::task::spawn_blocking(move || {
        compositor.render(avatar.as_deref(), width, height, elapsed.as_secs_f64(), &label)
    })
    .await
    .map_err(|e| Error::Internal(format!("render task failed: {}", e)))?;

    Ok(Frame { image, meta })
}
