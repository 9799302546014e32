use crate::session::FrameMetadata;
use anyhow::Result;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Sync role of this capture process. Exactly one device on the rig runs
/// as server; the rest are clients. Static for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    Server,
    Client,
}

/// One completed frame from the capture collaborator: raw payload plus its
/// ISP metadata. Wallclock and sync flag ride inside the metadata.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub payload: Bytes,
    pub metadata: FrameMetadata,
}

impl CapturedFrame {
    /// Capture-device wallclock in seconds (metadata carries microseconds).
    pub fn wallclock(&self) -> f64 {
        self.metadata.frame_wall_clock as f64 / 1e6
    }
}

/// The camera acquisition seam. `next_frame` suspends until the next
/// completed frame buffer and metadata are ready; it is the capture loop's
/// only suspension point.
#[allow(async_fn_in_trait)]
pub trait FrameSource {
    async fn next_frame(&mut self) -> Result<CapturedFrame>;
}

/// The shared digital "ready" handshake line. Asserted by the sync server
/// during capture and by the sensor recorder for the duration of its
/// stream; deasserted at teardown.
pub trait ReadyLine: Send + 'static {
    fn set_active(&mut self, active: bool) -> Result<()>;
}

/// Scoped ownership of a ready line. The line starts deasserted and is
/// deasserted again when the guard drops, on every exit path including
/// panics.
pub struct ReadyGuard<L: ReadyLine> {
    line: L,
}

impl<L: ReadyLine> ReadyGuard<L> {
    pub fn acquire(mut line: L) -> Result<Self> {
        line.set_active(false)?;
        Ok(ReadyGuard { line })
    }

    pub fn assert(&mut self) -> Result<()> {
        self.line.set_active(true)
    }
}

impl<L: ReadyLine> Drop for ReadyGuard<L> {
    fn drop(&mut self) {
        if let Err(e) = self.line.set_active(false) {
            tracing::warn!("failed to deassert ready line on teardown: {e:#}");
        }
    }
}

/// Outcome of one bulk read against the sensor streaming endpoint.
#[derive(Debug, Clone)]
pub enum TransferStatus {
    Completed(Bytes),
    Cancelled,
    Failed(String),
}

/// The sensor-device seam: a single bulk IN endpoint plus the vendor
/// start/stop control transfer. Handles are clonable so several reads can
/// be in flight at once.
#[allow(async_fn_in_trait)]
pub trait BulkEndpoint: Clone {
    async fn read(&self, len: usize) -> TransferStatus;
    async fn set_streaming(&self, enable: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Mock backends. Used by the CLI when no vendor integration is attached and
// by the unit tests. The real camera stack and USB device plug in through
// the traits above.
// ---------------------------------------------------------------------------

/// In-memory ready line whose state tests can observe.
#[derive(Clone, Default)]
pub struct MockReadyLine {
    active: Arc<AtomicBool>,
}

impl MockReadyLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl ReadyLine for MockReadyLine {
    fn set_active(&mut self, active: bool) -> Result<()> {
        self.active.store(active, Ordering::Release);
        Ok(())
    }
}

/// Replays a fixed list of frames, then reports end-of-stream as an error
/// (a real camera never runs out; tests use this to terminate the loop).
pub struct ScriptedCamera {
    frames: std::vec::IntoIter<CapturedFrame>,
}

impl ScriptedCamera {
    pub fn new(frames: Vec<CapturedFrame>) -> Self {
        ScriptedCamera { frames: frames.into_iter() }
    }
}

impl FrameSource for ScriptedCamera {
    async fn next_frame(&mut self) -> Result<CapturedFrame> {
        match self.frames.next() {
            Some(frame) => Ok(frame),
            None => anyhow::bail!("camera stream ended"),
        }
    }
}

/// Synthesizes frames at the nominal rate, all marked synchronized. Stands
/// in for the vendor camera stack when none is attached.
pub struct MockCamera {
    interval: std::time::Duration,
    next_wallclock_us: u64,
    frame_index: u64,
}

impl MockCamera {
    pub fn new(frame_rate: f64) -> Self {
        let now_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        MockCamera {
            interval: std::time::Duration::from_secs_f64(1.0 / frame_rate),
            next_wallclock_us: now_us,
            frame_index: 0,
        }
    }
}

impl FrameSource for MockCamera {
    async fn next_frame(&mut self) -> Result<CapturedFrame> {
        tokio::time::sleep(self.interval).await;
        let wallclock = self.next_wallclock_us;
        self.next_wallclock_us += self.interval.as_micros() as u64;
        self.frame_index += 1;

        Ok(CapturedFrame {
            payload: Bytes::from(vec![0u8; 64]),
            metadata: FrameMetadata {
                sensor_black_levels: vec![4096; 4],
                colour_gains: [2.0, 1.5],
                colour_correction_matrix: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
                analogue_gain: 1.0,
                digital_gain: 1.0,
                exposure_time: 1000,
                sensor_timestamp: self.frame_index * 1_000_000,
                sync_ready: true,
                frame_wall_clock: wallclock,
            },
        })
    }
}

struct MockSensorState {
    chunks: Vec<Bytes>,
    next: usize,
}

/// Serves a fixed sequence of payload chunks; reads past the end report
/// `Cancelled`, mirroring a device whose transfers were torn down.
#[derive(Clone)]
pub struct MockSensorEndpoint {
    state: Arc<Mutex<MockSensorState>>,
    enables: Arc<AtomicU32>,
    disables: Arc<AtomicU32>,
    fail_control: bool,
}

impl MockSensorEndpoint {
    pub fn new(chunks: Vec<Bytes>) -> Self {
        MockSensorEndpoint {
            state: Arc::new(Mutex::new(MockSensorState { chunks, next: 0 })),
            enables: Arc::new(AtomicU32::new(0)),
            disables: Arc::new(AtomicU32::new(0)),
            fail_control: false,
        }
    }

    /// Endpoint whose control transfers fail, for teardown-path tests.
    pub fn with_failing_control(chunks: Vec<Bytes>) -> Self {
        let mut ep = Self::new(chunks);
        ep.fail_control = true;
        ep
    }

    /// Endpoint producing `count` chunks of a repeating byte pattern.
    pub fn with_pattern(count: usize, chunk_len: usize) -> Self {
        let chunks = (0..count)
            .map(|i| Bytes::from(vec![(i % 251) as u8; chunk_len]))
            .collect();
        Self::new(chunks)
    }

    pub fn enable_count(&self) -> u32 {
        self.enables.load(Ordering::Acquire)
    }

    pub fn disable_count(&self) -> u32 {
        self.disables.load(Ordering::Acquire)
    }
}

impl BulkEndpoint for MockSensorEndpoint {
    async fn read(&self, len: usize) -> TransferStatus {
        let mut state = self.state.lock().expect("mock sensor state");
        if state.next >= state.chunks.len() {
            return TransferStatus::Cancelled;
        }
        let chunk = state.chunks[state.next].clone();
        state.next += 1;
        let take = chunk.len().min(len);
        TransferStatus::Completed(chunk.slice(0..take))
    }

    async fn set_streaming(&self, enable: bool) -> Result<()> {
        if self.fail_control {
            anyhow::bail!("control transfer failed");
        }
        if enable {
            self.enables.fetch_add(1, Ordering::AcqRel);
        } else {
            self.disables.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
}
