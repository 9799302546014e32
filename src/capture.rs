use crate::config::CaptureConfig;
use crate::hardware::{CapturedFrame, FrameSource, ReadyGuard, ReadyLine, SyncRole};
use crate::session::FrameKey;
use anyhow::{bail, Context, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle of one camera capture process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Configuring,
    Streaming,
    Stopping,
    Faulted,
    Stopped,
}

/// Counters shared with whoever wants a live snapshot of the loop.
#[derive(Default)]
pub struct CaptureStats {
    frames_written: AtomicU64,
    frames_discarded: AtomicU64,
    drops_flagged: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSnapshot {
    pub frames_written: u64,
    pub frames_discarded: u64,
    pub drops_flagged: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            frames_written: self.frames_written.load(Ordering::Acquire),
            frames_discarded: self.frames_discarded.load(Ordering::Acquire),
            drops_flagged: self.drops_flagged.load(Ordering::Acquire),
        }
    }
}

/// Flags frame-to-frame wallclock deltas that are not the nominal
/// inter-frame interval. Detection is advisory: nothing is retried or
/// reconstructed.
pub struct DropDetector {
    nominal: f64,
    tolerance: f64,
    last_wallclock: Option<f64>,
}

impl DropDetector {
    pub fn new(frame_rate: f64, tolerance: f64) -> Self {
        DropDetector { nominal: 1.0 / frame_rate, tolerance, last_wallclock: None }
    }

    /// Feed the next frame's wallclock. Returns the offending delta when
    /// it deviates from the nominal interval.
    pub fn observe(&mut self, wallclock: f64) -> Option<f64> {
        let flagged = match self.last_wallclock {
            Some(last) => {
                let delta = wallclock - last;
                ((delta - self.nominal).abs() > self.tolerance).then_some(delta)
            }
            None => None,
        };
        self.last_wallclock = Some(wallclock);
        flagged
    }
}

/// Coordinates one camera's acquisition loop with the rig-wide sync
/// handshake: awaits completed frames, persists only synchronized ones,
/// flags dropped frames, and (as server) drives the ready line.
pub struct CaptureController {
    ordinal: u8,
    role: SyncRole,
    cfg: CaptureConfig,
    state: CaptureState,
    stats: Arc<CaptureStats>,
}

impl CaptureController {
    pub fn new(ordinal: u8, role: SyncRole, cfg: CaptureConfig) -> Self {
        CaptureController { ordinal, role, cfg, state: CaptureState::Idle, stats: Arc::default() }
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    fn transition(&mut self, next: CaptureState) {
        tracing::info!("c{}: {:?} -> {:?}", self.ordinal, self.state, next);
        self.state = next;
    }

    /// Run the capture loop until `shutdown` resolves or the frame source
    /// faults. The ready line (server role only) is released on every exit
    /// path; a fault terminates the loop without restart.
    pub async fn run<S, L>(
        &mut self,
        mut source: S,
        line: Option<L>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<CaptureSnapshot>
    where
        S: FrameSource,
        L: ReadyLine,
    {
        self.transition(CaptureState::Configuring);
        if let Err(e) = self.configure().await {
            self.transition(CaptureState::Faulted);
            return Err(e);
        }

        // Server owns the handshake line for the whole streaming phase;
        // the guard deasserts it on drop, fault paths included.
        let mut ready = match (self.role, line) {
            (SyncRole::Server, Some(line)) => Some(ReadyGuard::acquire(line)?),
            (SyncRole::Server, None) => {
                self.transition(CaptureState::Faulted);
                bail!("server role requires a ready line");
            }
            (SyncRole::Client, _) => None,
        };

        self.transition(CaptureState::Streaming);
        let mut detector = DropDetector::new(self.cfg.frame_rate, self.cfg.drop_tolerance_s);

        let result = {
            tokio::pin!(shutdown);
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = &mut shutdown => break Ok(()),
                    frame = source.next_frame() => frame,
                };
                let outcome = match frame {
                    Ok(frame) => self.resolve(&frame, &mut detector, &mut ready).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = outcome {
                    break Err(e);
                }
            }
        };

        // Both exits converge on Stopped; the ready line is deasserted in
        // between by dropping the guard.
        match result {
            Ok(()) => self.transition(CaptureState::Stopping),
            Err(ref e) => {
                tracing::error!("c{}: capture loop fault: {e:#}", self.ordinal);
                self.transition(CaptureState::Faulted);
            }
        }
        drop(ready);
        self.transition(CaptureState::Stopped);

        result.map(|_| self.stats.snapshot())
    }

    async fn configure(&self) -> Result<()> {
        if !self.cfg.tuning_file.is_file() {
            bail!("tuning file {} not found", self.cfg.tuning_file.display());
        }
        tokio::fs::create_dir_all(&self.cfg.output_dir)
            .await
            .with_context(|| format!("creating output dir {}", self.cfg.output_dir.display()))?;

        if self.role == SyncRole::Client && self.cfg.client_start_delay_s > 0.0 {
            // Starting both cameras at the same instant races the camera
            // stack; clients wait out the server's startup.
            tokio::time::sleep(std::time::Duration::from_secs_f64(self.cfg.client_start_delay_s))
                .await;
        }
        Ok(())
    }

    async fn resolve<L: ReadyLine>(
        &self,
        frame: &CapturedFrame,
        detector: &mut DropDetector,
        ready: &mut Option<ReadyGuard<L>>,
    ) -> Result<()> {
        let wallclock = frame.wallclock();

        if let Some(delta) = detector.observe(wallclock) {
            self.stats.drops_flagged.fetch_add(1, Ordering::AcqRel);
            tracing::warn!("c{}: dropped frame at {wallclock:.3}, delta {delta:.3}s", self.ordinal);
        }

        if !frame.metadata.sync_ready {
            self.stats.frames_discarded.fetch_add(1, Ordering::AcqRel);
            tracing::debug!("c{}: unsynchronized frame at {wallclock:.3} discarded", self.ordinal);
            return Ok(());
        }

        let key = FrameKey { ts: wallclock, cam: self.ordinal };
        let raw_path = self.cfg.output_dir.join(key.file_name(&self.cfg.raw_ext));
        let meta_path = self.cfg.output_dir.join(key.file_name("json"));

        tokio::fs::write(&raw_path, &frame.payload)
            .await
            .with_context(|| format!("writing {}", raw_path.display()))?;

        if let Some(guard) = ready {
            guard.assert()?;
        }

        let meta_json = serde_json::to_string(&frame.metadata)?;
        tokio::fs::write(&meta_path, meta_json)
            .await
            .with_context(|| format!("writing {}", meta_path.display()))?;

        let written = self.stats.frames_written.fetch_add(1, Ordering::AcqRel) + 1;
        if written % 100 == 0 {
            tracing::info!("c{}: {written} frames written", self.ordinal);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{MockReadyLine, ScriptedCamera};
    use crate::session::{test_metadata, FrameMetadata};
    use bytes::Bytes;
    use tempfile::TempDir;

    fn frame(wallclock_s: f64, sync_ready: bool) -> CapturedFrame {
        let mut metadata: FrameMetadata = test_metadata(sync_ready);
        metadata.frame_wall_clock = (wallclock_s * 1e6).round() as u64;
        CapturedFrame { payload: Bytes::from_static(b"rawpixels"), metadata }
    }

    fn test_config(dir: &TempDir) -> CaptureConfig {
        let tuning = dir.path().join("tuning.json");
        std::fs::write(&tuning, "{}").unwrap();
        CaptureConfig {
            output_dir: dir.path().join("out"),
            frame_rate: 1.0,
            raw_ext: "srggb16".to_string(),
            tuning_file: tuning,
            client_start_delay_s: 0.0,
            drop_tolerance_s: 0.001,
        }
    }

    #[test]
    fn test_drop_detector_flags_single_gap() {
        let mut det = DropDetector::new(1.0, 0.001);
        let events: Vec<_> = [100.0, 101.0, 102.0, 104.0, 105.0]
            .iter()
            .enumerate()
            .filter_map(|(i, ts)| det.observe(*ts).map(|delta| (i, delta)))
            .collect();
        assert_eq!(events, vec![(3, 2.0)]);
    }

    #[test]
    fn test_drop_detector_tolerates_rounding() {
        let mut det = DropDetector::new(1.0, 0.001);
        assert_eq!(det.observe(100.0), None);
        assert_eq!(det.observe(101.0004), None);
        assert_eq!(det.observe(102.0), None);
    }

    #[tokio::test]
    async fn test_only_synchronized_frames_persisted() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let out = cfg.output_dir.clone();

        let camera = ScriptedCamera::new(vec![
            frame(100.0, false),
            frame(101.0, true),
            frame(102.0, true),
        ]);
        let mut ctl = CaptureController::new(0, SyncRole::Client, cfg);
        // Scripted source ends with an error once exhausted.
        let result = ctl.run::<_, MockReadyLine>(camera, None, std::future::pending()).await;
        assert!(result.is_err());
        assert_eq!(ctl.state(), CaptureState::Stopped);

        let snap = ctl.stats().snapshot();
        assert_eq!(snap.frames_written, 2);
        assert_eq!(snap.frames_discarded, 1);

        assert!(!out.join("100.000_c0.srggb16").exists());
        assert!(out.join("101.000_c0.srggb16").exists());
        assert!(out.join("101.000_c0.json").exists());
        assert!(out.join("102.000_c0.srggb16").exists());

        let meta: FrameMetadata =
            serde_json::from_str(&std::fs::read_to_string(out.join("101.000_c0.json")).unwrap())
                .unwrap();
        assert!(meta.sync_ready);
    }

    #[tokio::test]
    async fn test_server_asserts_and_releases_ready_line() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let line = MockReadyLine::new();

        let camera = ScriptedCamera::new(vec![frame(100.0, true)]);
        let mut ctl = CaptureController::new(0, SyncRole::Server, cfg);
        let result = ctl.run(camera, Some(line.clone()), std::future::pending()).await;

        // Fault path: line must still end up deasserted.
        assert!(result.is_err());
        assert!(!line.is_active());
        assert_eq!(ctl.stats().snapshot().frames_written, 1);
    }

    #[tokio::test]
    async fn test_clean_stop_path() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let line = MockReadyLine::new();

        let camera = ScriptedCamera::new(vec![]);
        let mut ctl = CaptureController::new(1, SyncRole::Server, cfg);
        // Shutdown already resolved: loop stops before touching the source.
        let snap = ctl.run(camera, Some(line.clone()), std::future::ready(())).await.unwrap();

        assert_eq!(ctl.state(), CaptureState::Stopped);
        assert_eq!(snap.frames_written, 0);
        assert!(!line.is_active());
    }

    #[tokio::test]
    async fn test_missing_tuning_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.tuning_file = dir.path().join("missing.json");

        let camera = ScriptedCamera::new(vec![frame(100.0, true)]);
        let mut ctl = CaptureController::new(0, SyncRole::Client, cfg);
        let result = ctl.run::<_, MockReadyLine>(camera, None, std::future::pending()).await;
        assert!(result.is_err());
        assert_eq!(ctl.state(), CaptureState::Faulted);
    }

    #[tokio::test]
    async fn test_server_without_line_rejected() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let camera = ScriptedCamera::new(vec![]);
        let mut ctl = CaptureController::new(0, SyncRole::Server, cfg);
        let result = ctl.run::<_, MockReadyLine>(camera, None, std::future::pending()).await;
        assert!(result.is_err());
    }
}
