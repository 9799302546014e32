use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Identity of one captured frame, carried in its filename:
/// `{ts:.3}_c{cam}.{ext}`. Raw payload and metadata sidecar of the same
/// frame share the identical key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameKey {
    /// Capture-device wallclock, seconds, millisecond resolution.
    pub ts: f64,
    pub cam: u8,
}

impl FrameKey {
    /// Filename without extension: `{ts:.3}_c{cam}`.
    pub fn base_name(&self) -> String {
        format!("{:.3}_c{}", self.ts, self.cam)
    }

    pub fn file_name(&self, ext: &str) -> String {
        format!("{}.{}", self.base_name(), ext)
    }

    /// Parse a frame filename with the given extension. Returns `None` for
    /// names that do not match the contract; other files routinely share
    /// the session directory.
    pub fn parse(file_name: &str, ext: &str) -> Option<FrameKey> {
        let stem = file_name.strip_suffix(&format!(".{ext}"))?;
        let (ts_str, cam_str) = stem.split_once("_c")?;
        if ts_str.is_empty() || !ts_str.contains('.') {
            return None;
        }
        let ts: f64 = ts_str.parse().ok()?;
        let cam: u8 = cam_str.parse().ok()?;
        Some(FrameKey { ts, cam })
    }
}

/// Per-frame sensor/ISP metadata, the JSON sidecar written next to each raw
/// frame. Field names follow the capture collaborator's control names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(rename = "SensorBlackLevels")]
    pub sensor_black_levels: Vec<u16>,
    #[serde(rename = "ColourGains")]
    pub colour_gains: [f64; 2],
    #[serde(rename = "ColourCorrectionMatrix")]
    pub colour_correction_matrix: [f64; 9],
    #[serde(rename = "AnalogueGain")]
    pub analogue_gain: f64,
    #[serde(rename = "DigitalGain")]
    pub digital_gain: f64,
    /// Microseconds.
    #[serde(rename = "ExposureTime")]
    pub exposure_time: u32,
    #[serde(rename = "SensorTimestamp")]
    pub sensor_timestamp: u64,
    #[serde(rename = "SyncReady", default)]
    pub sync_ready: bool,
    /// Microseconds on the capture-device clock.
    #[serde(rename = "FrameWallClock")]
    pub frame_wall_clock: u64,
}

/// One discovered metadata sidecar, not yet parsed. Parsing is deferred to
/// the correlator so a malformed file can be skipped and counted there.
#[derive(Debug, Clone)]
pub struct MetadataFile {
    pub key: FrameKey,
    pub path: PathBuf,
}

impl MetadataFile {
    pub fn load(&self) -> Result<FrameMetadata> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let meta: FrameMetadata = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(meta)
    }
}

/// A capture session ("flight") directory: all raw frames and metadata
/// sidecars for one mission. Metadata lives under `meta/` and raw payloads
/// under `raw/` when those subdirectories exist, otherwise flat.
pub struct Session {
    meta_dir: PathBuf,
    raw_dir: PathBuf,
    raw_ext: String,
}

impl Session {
    pub fn open(root: &Path, raw_ext: &str) -> Result<Session> {
        if !root.is_dir() {
            bail!("session directory {} does not exist", root.display());
        }
        let meta_dir = root.join("meta");
        let raw_dir = root.join("raw");
        let (meta_dir, raw_dir) = if meta_dir.is_dir() && raw_dir.is_dir() {
            (meta_dir, raw_dir)
        } else {
            (root.to_path_buf(), root.to_path_buf())
        };
        Ok(Session { meta_dir, raw_dir, raw_ext: raw_ext.to_string() })
    }

    /// All metadata sidecars in the session, sorted by filename.
    pub fn metadata_files(&self) -> Result<Vec<MetadataFile>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.meta_dir)
            .with_context(|| format!("listing {}", self.meta_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(key) = FrameKey::parse(name, "json") {
                out.push(MetadataFile { key, path });
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Deterministic path of the raw payload paired with `key`. The pairing
    /// is by name construction, never by search.
    pub fn raw_path_for(&self, key: &FrameKey) -> PathBuf {
        self.raw_dir.join(key.file_name(&self.raw_ext))
    }
}

#[cfg(test)]
pub(crate) fn test_metadata(sync_ready: bool) -> FrameMetadata {
    FrameMetadata {
        sensor_black_levels: vec![4096, 4096, 4096, 4096],
        colour_gains: [2.0, 1.5],
        colour_correction_matrix: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
        analogue_gain: 1.0,
        digital_gain: 1.0,
        exposure_time: 1000,
        sensor_timestamp: 123_456_789_000,
        sync_ready,
        frame_wall_clock: 100_000_000,
    }
}
