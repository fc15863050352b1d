//! Audio output.
//!
//! Players start playback and return immediately; they report the end of
//! playback through the completion callback, which may run on any thread and
//! may run more than once.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::wav::wav_duration;

pub type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

pub trait AudioPlayer: Send + Sync {
    /// Begin playing `path` at `volume` (0.0..=1.0).
    fn start(&self, path: &Path, volume: f32, on_complete: CompletionCallback) -> anyhow::Result<()>;

    /// Stop the current playback. Completion still fires.
    fn stop(&self);

    fn is_idle(&self) -> bool;
}

/// The one playback a player may have running
#[derive(Default)]
struct Slot {
    active: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl Slot {
    fn begin(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self.lock().replace((id, token.clone())) {
            previous.cancel();
        }
        (id, token)
    }

    fn end(&self, id: u64) {
        let mut active = self.lock();
        if matches!(*active, Some((current, _)) if current == id) {
            *active = None;
        }
    }

    fn stop(&self) {
        if let Some((_, token)) = self.lock().as_ref() {
            token.cancel();
        }
    }

    fn is_idle(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn runtime() -> anyhow::Result<Handle> {
    Handle::try_current().context("audio playback needs a tokio runtime")
}

/// Plays nothing; completes after the WAV file's duration.
#[derive(Default)]
pub struct HeadlessPlayer {
    slot: Arc<Slot>,
    speed: Option<f32>,
}

impl HeadlessPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scale playing time, e.g. `2.0` finishes twice as fast.
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = Some(speed.max(0.01));
        self
    }
}

impl AudioPlayer for HeadlessPlayer {
    fn start(&self, path: &Path, volume: f32, on_complete: CompletionCallback) -> anyhow::Result<()> {
        let handle = runtime()?;
        let mut duration = wav_duration(path)?;
        if let Some(speed) = self.speed {
            duration = duration.div_f32(speed);
        }
        debug!(path = %path.display(), volume, duration_ms = duration.as_millis() as u64, "Headless playback");

        let (id, token) = self.slot.begin();
        let slot = Arc::clone(&self.slot);
        handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = token.cancelled() => {}
            }
            slot.end(id);
            on_complete();
        });
        Ok(())
    }

    fn stop(&self) {
        self.slot.stop();
    }

    fn is_idle(&self) -> bool {
        self.slot.is_idle()
    }
}

/// Plays through an external program.
///
/// The template is split on whitespace; `{path}` and `{volume}` (0-100) are
/// substituted per argument, e.g. `ffplay -nodisp -autoexit -volume {volume} {path}`.
pub struct CommandPlayer {
    template: Vec<String>,
    slot: Arc<Slot>,
}

impl CommandPlayer {
    pub fn new(template: &str) -> anyhow::Result<Self> {
        let template: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if template.is_empty() {
            anyhow::bail!("player command is empty");
        }
        Ok(Self {
            template,
            slot: Arc::new(Slot::default()),
        })
    }

    fn args_for(&self, path: &Path, volume: f32) -> Vec<String> {
        let volume = ((volume.clamp(0.0, 1.0) * 100.0).round() as u32).to_string();
        let path = path.display().to_string();
        self.template
            .iter()
            .map(|arg| arg.replace("{path}", &path).replace("{volume}", &volume))
            .collect()
    }
}

impl AudioPlayer for CommandPlayer {
    fn start(&self, path: &Path, volume: f32, on_complete: CompletionCallback) -> anyhow::Result<()> {
        let handle = runtime()?;
        let args = self.args_for(path, volume);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("player command is empty"))?;

        // spawn inside the runtime so the child is registered with its reactor
        let _guard = handle.enter();
        let mut child = tokio::process::Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start player '{program}'"))?;

        let (id, token) = self.slot.begin();
        let slot = Arc::clone(&self.slot);
        handle.spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if !status.success() => warn!(%status, "Player exited with failure"),
                    Err(e) => warn!(error = %e, "Failed waiting for player"),
                    Ok(_) => {}
                },
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to stop player");
                    }
                }
            }
            slot.end(id);
            on_complete();
        });
        Ok(())
    }

    fn stop(&self) {
        self.slot.stop();
    }

    fn is_idle(&self) -> bool {
        self.slot.is_idle()
    }
}
