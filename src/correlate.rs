use crate::calibration::FrameCalibration;
use crate::config::CorrelateConfig;
use crate::session::{FrameKey, Session};
use crate::telemetry::{Attitude, Position, TelemetryLog};
use crate::timemap::TimeMap;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset};
use std::path::{Path, PathBuf};

/// Directory name the external tagging tool expects images under.
const IMAGES_DIR: &str = "images";

/// EXIF orientation assigned per camera position on the rig. Camera 2 is
/// mounted rotated 270°; the others are upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orientation {
    pub code: u8,
    pub label: &'static str,
}

pub fn orientation_for(cam: u8) -> Orientation {
    if cam == 2 {
        Orientation { code: 8, label: "Rotate 270 CW" }
    } else {
        Orientation { code: 1, label: "Horizontal (normal)" }
    }
}

/// One qualifying frame, fused and calibrated: everything the export and
/// the downstream raw converter need.
#[derive(Debug, Clone)]
pub struct CalibratedFrameRecord {
    pub key: FrameKey,
    pub source_path: PathBuf,
    pub target_file_name: String,
    pub camera_name: Option<String>,
    pub vehicle_time: f64,
    pub subsec_ms: u16,
    pub attitude: Attitude,
    pub position: Position,
    pub calibration: FrameCalibration,
    pub orientation: Orientation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelateSummary {
    pub frames_seen: u64,
    pub written: u64,
    pub skipped_unmapped: u64,
    pub skipped_altitude: u64,
    pub skipped_missing_raw: u64,
    pub skipped_malformed: u64,
}

/// Offline fusion pass: maps each recorded frame onto the vehicle clock,
/// interpolates attitude and position, gates on altitude, computes the
/// per-frame calibration, and emits one record per qualifying frame.
pub struct Correlator<'a> {
    cfg: &'a CorrelateConfig,
    time_map: &'a TimeMap,
    log: &'a TelemetryLog,
}

impl<'a> Correlator<'a> {
    pub fn new(cfg: &'a CorrelateConfig, time_map: &'a TimeMap, log: &'a TelemetryLog) -> Self {
        Correlator { cfg, time_map, log }
    }

    pub fn run(&self, session: &Session) -> Result<(Vec<CalibratedFrameRecord>, CorrelateSummary)> {
        if self.log.attitude_count() == 0 || self.log.position_count() == 0 {
            bail!("telemetry log has no attitude or position samples");
        }

        let mut records = Vec::new();
        let mut summary = CorrelateSummary::default();

        for meta_file in session.metadata_files()? {
            summary.frames_seen += 1;
            let key = meta_file.key;

            let meta = match meta_file.load() {
                Ok(meta) => meta,
                Err(e) => {
                    summary.skipped_malformed += 1;
                    tracing::warn!("skipping malformed sidecar: {e:#}");
                    continue;
                }
            };

            // Outside the calibrated clock span the frame cannot be
            // trusted; skip it rather than mis-geotag it.
            let Some(vehicle_time) = self.time_map.forward(key.ts) else {
                summary.skipped_unmapped += 1;
                tracing::warn!("frame {} has no vehicle-clock mapping, skipped", key.base_name());
                continue;
            };

            let attitude = self.log.attitude_interp(vehicle_time);
            let position = self.log.position_interp(vehicle_time);

            if position.alt < self.cfg.altitude_gate_m {
                summary.skipped_altitude += 1;
                tracing::debug!(
                    "frame {} below operating altitude ({:.1} m), skipped",
                    key.base_name(),
                    position.alt
                );
                continue;
            }

            let source_path = session.raw_path_for(&key);
            if !source_path.is_file() {
                summary.skipped_missing_raw += 1;
                tracing::warn!("raw payload {} missing, frame skipped", source_path.display());
                continue;
            }

            let calibration = match FrameCalibration::compute(
                &meta,
                &self.cfg.raw_format,
                key.cam,
                self.cfg.profile.iso_base,
            ) {
                Ok(cal) => cal,
                Err(e) => {
                    summary.skipped_malformed += 1;
                    tracing::warn!("frame {}: calibration failed: {e:#}", key.base_name());
                    continue;
                }
            };

            let camera_name = self.cfg.camera_name(key.cam).map(str::to_string);
            if camera_name.is_none() {
                tracing::warn!("no camera name configured for ordinal {}", key.cam);
            }

            let total_ms = (vehicle_time * 1000.0).round() as i64;
            records.push(CalibratedFrameRecord {
                key,
                target_file_name: format!("{}{}", key.base_name(), self.cfg.target_ext),
                source_path,
                camera_name,
                vehicle_time,
                subsec_ms: total_ms.rem_euclid(1000) as u16,
                attitude,
                position,
                calibration,
                orientation: orientation_for(key.cam),
            });
            summary.written += 1;
        }

        tracing::info!(
            "correlated {} of {} frames ({} unmapped, {} below altitude, {} missing raw, {} malformed)",
            summary.written,
            summary.frames_seen,
            summary.skipped_unmapped,
            summary.skipped_altitude,
            summary.skipped_missing_raw,
            summary.skipped_malformed
        );
        Ok((records, summary))
    }
}

/// Export mode for the tagging tool. In raw-convert mode the DNG writer
/// applies rotation itself, so the Orientation column is omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    DirectTag,
    RawConvert,
}

const EXPORT_COLUMNS: &[&str] = &[
    "SourceFile",
    "Directory",
    "FileName",
    "DateTime",
    "SubSecTime",
    "OffsetTime",
    "DateTimeOriginal",
    "SubSecTimeOriginal",
    "OffsetTimeOriginal",
    "GPSLatitude",
    "GPSLatitudeRef",
    "GPSLongitude",
    "GPSLongitudeRef",
    "GPSAltitude",
    "GPSAltitudeRef",
    "Make",
    "Model",
    "Aperture",
    "ExifImageWidth",
    "ExifImageHeight",
    "ExposureTime",
    "ShutterSpeedValue",
    "ShutterSpeed",
    "FNumber",
    "FocalLength",
    "ISO",
];

/// Write the tabular export consumed by the external metadata-tagging
/// tool. Column order is fixed; the file is written to a temp name and
/// atomically renamed so a failed pass leaves no partial export.
pub fn export_csv(
    records: &[CalibratedFrameRecord],
    cfg: &CorrelateConfig,
    out_path: &Path,
    mode: ExportMode,
) -> Result<()> {
    let offset = parse_utc_offset(&cfg.utc_offset)?;

    let tmp_path = out_path.with_extension("csv.tmp");
    let mut writer = csv::Writer::from_path(&tmp_path)
        .with_context(|| format!("creating {}", tmp_path.display()))?;

    let mut header: Vec<&str> = EXPORT_COLUMNS.to_vec();
    if mode == ExportMode::DirectTag {
        header.push("Orientation");
    }
    writer.write_record(&header)?;

    for record in records {
        let dt = vehicle_datetime(record.vehicle_time, offset)?;
        let date_str = dt.format("%Y:%m:%d %H:%M:%S").to_string();
        let subsec = format!("{:03}", record.subsec_ms);

        let (lat, lat_ref) = hemisphere(record.position.lat, "North", "South");
        let (lon, lon_ref) = hemisphere(record.position.lon, "East", "West");

        let profile = &cfg.profile;
        let shutter = format!("1/{}", record.calibration.shutter.1);

        let mut row = vec![
            format!("{IMAGES_DIR}/{}", record.target_file_name),
            IMAGES_DIR.to_string(),
            record.target_file_name.clone(),
            date_str.clone(),
            subsec.clone(),
            cfg.utc_offset.clone(),
            date_str,
            subsec,
            cfg.utc_offset.clone(),
            format!("{lat}"),
            lat_ref.to_string(),
            format!("{lon}"),
            lon_ref.to_string(),
            format!("{}", record.position.alt),
            "Above Sea Level".to_string(),
            profile.make.clone(),
            format!("{}{}", profile.model_prefix, record.key.cam),
            format!("{}", profile.aperture),
            profile.image_width.to_string(),
            profile.image_height.to_string(),
            shutter.clone(),
            shutter.clone(),
            shutter,
            format!("{}", profile.aperture),
            format!("{} mm", profile.focal_length_mm),
            record.calibration.iso.to_string(),
        ];
        if mode == ExportMode::DirectTag {
            row.push(record.orientation.label.to_string());
        }
        writer.write_record(&row)?;
    }

    writer.flush()?;
    drop(writer);
    std::fs::rename(&tmp_path, out_path)
        .with_context(|| format!("renaming export into place at {}", out_path.display()))?;
    tracing::info!("wrote {} records to {}", records.len(), out_path.display());
    Ok(())
}

fn hemisphere(value: f64, positive: &'static str, negative: &'static str) -> (f64, &'static str) {
    if value < 0.0 {
        (-value, negative)
    } else {
        (value, positive)
    }
}

fn parse_utc_offset(s: &str) -> Result<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'-') => (-1, &s[1..]),
        Some(b'+') => (1, &s[1..]),
        _ => (1, s),
    };
    let (hh, mm) = rest
        .split_once(':')
        .with_context(|| format!("bad UTC offset {s:?}, expected ±HH:MM"))?;
    let hours: i32 = hh.parse().with_context(|| format!("bad UTC offset {s:?}"))?;
    let minutes: i32 = mm.parse().with_context(|| format!("bad UTC offset {s:?}"))?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .with_context(|| format!("UTC offset {s:?} out of range"))
}

fn vehicle_datetime(t: f64, offset: FixedOffset) -> Result<DateTime<FixedOffset>> {
    let total_ms = (t * 1000.0).round() as i64;
    let dt = DateTime::from_timestamp_millis(total_ms)
        .with_context(|| format!("vehicle time {t} out of range"))?;
    Ok(dt.with_timezone(&offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_metadata;
    use tempfile::TempDir;

    /// Session with one raw+sidecar pair per (ts, cam), plus a telemetry
    /// log holding constant attitude and the given altitude everywhere.
    struct Fixture {
        dir: TempDir,
        log: TelemetryLog,
        map: TimeMap,
    }

    fn fixture(frames: &[(f64, u8)], altitude: f64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let meta_json = serde_json::to_string(&test_metadata(true)).unwrap();
        for (ts, cam) in frames {
            let key = FrameKey { ts: *ts, cam: *cam };
            std::fs::write(dir.path().join(key.file_name("json")), &meta_json).unwrap();
            std::fs::write(dir.path().join(key.file_name("srggb16")), b"raw").unwrap();
        }

        let log_content = [
            "80.000 ATT {Roll : 1.0, Pitch : 2.0, Yaw : 30.0}".to_string(),
            "130.000 ATT {Roll : 1.0, Pitch : 2.0, Yaw : 30.0}".to_string(),
            format!("80.000 POS {{Lat : 37.5, Lng : -122.3, Alt : {altitude}}}"),
            format!("130.000 POS {{Lat : 37.5, Lng : -122.3, Alt : {altitude}}}"),
        ]
        .join("\n");
        let log = TelemetryLog::parse(&log_content);
        let map = TimeMap::new(vec![(90.0, 91.0), (110.0, 111.0)]).unwrap();
        Fixture { dir, log, map }
    }

    fn test_cfg() -> CorrelateConfig {
        crate::config::AppConfig::load_default().unwrap().correlate
    }

    #[test]
    fn test_end_to_end_two_cameras() {
        let fx = fixture(&[(100.0, 0), (100.0, 1)], 200.0);
        let cfg = test_cfg();
        let session = Session::open(fx.dir.path(), "srggb16").unwrap();

        let correlator = Correlator::new(&cfg, &fx.map, &fx.log);
        let (records, summary) = correlator.run(&session).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(summary.written, 2);
        assert_eq!(records[0].vehicle_time, 101.0);
        assert_eq!(records[0].target_file_name, "100.000_c0.tif");
        assert_eq!(records[1].target_file_name, "100.000_c1.tif");
        assert_eq!(records[0].position.alt, 200.0);
        assert_eq!(records[0].attitude.yaw, 30.0);

        let out = fx.dir.path().join("exiftool.csv");
        export_csv(&records, &cfg, &out, ExportMode::DirectTag).unwrap();

        let content = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("SourceFile,Directory,FileName,DateTime"));
        assert!(lines[0].ends_with("ISO,Orientation"));
        assert!(lines[1].contains("Above Sea Level"));
        assert!(lines[1].contains("images/100.000_c0.tif"));
        assert!(lines[1].contains("West"));
        assert!(lines[1].contains("North"));
        // No temp file left behind.
        assert!(!fx.dir.path().join("exiftool.csv.tmp").exists());
    }

    #[test]
    fn test_unmapped_frames_skipped() {
        // 120.0 is outside the anchor span [90, 110].
        let fx = fixture(&[(100.0, 0), (120.0, 0)], 200.0);
        let cfg = test_cfg();
        let session = Session::open(fx.dir.path(), "srggb16").unwrap();

        let (records, summary) = Correlator::new(&cfg, &fx.map, &fx.log).run(&session).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(summary.skipped_unmapped, 1);
    }

    #[test]
    fn test_altitude_gate_boundary() {
        // Exactly at the threshold passes: the gate predicate is alt < threshold.
        let fx = fixture(&[(100.0, 0)], 190.0);
        let cfg = test_cfg();
        let session = Session::open(fx.dir.path(), "srggb16").unwrap();
        let (records, summary) = Correlator::new(&cfg, &fx.map, &fx.log).run(&session).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(summary.skipped_altitude, 0);

        let fx = fixture(&[(100.0, 0)], 189.9);
        let session = Session::open(fx.dir.path(), "srggb16").unwrap();
        let (records, summary) = Correlator::new(&cfg, &fx.map, &fx.log).run(&session).unwrap();
        assert!(records.is_empty());
        assert_eq!(summary.skipped_altitude, 1);
    }

    #[test]
    fn test_missing_raw_file_skipped() {
        let fx = fixture(&[(100.0, 0)], 200.0);
        std::fs::remove_file(fx.dir.path().join("100.000_c0.srggb16")).unwrap();
        let cfg = test_cfg();
        let session = Session::open(fx.dir.path(), "srggb16").unwrap();

        let (records, summary) = Correlator::new(&cfg, &fx.map, &fx.log).run(&session).unwrap();
        assert!(records.is_empty());
        assert_eq!(summary.skipped_missing_raw, 1);
    }

    #[test]
    fn test_malformed_sidecar_skipped() {
        let fx = fixture(&[(100.0, 0), (100.0, 1)], 200.0);
        std::fs::write(fx.dir.path().join("100.000_c0.json"), "{not json").unwrap();
        let cfg = test_cfg();
        let session = Session::open(fx.dir.path(), "srggb16").unwrap();

        let (records, summary) = Correlator::new(&cfg, &fx.map, &fx.log).run(&session).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(summary.skipped_malformed, 1);
        assert_eq!(records[0].key.cam, 1);
    }

    #[test]
    fn test_raw_convert_mode_omits_orientation() {
        let fx = fixture(&[(100.0, 2)], 200.0);
        let cfg = test_cfg();
        let session = Session::open(fx.dir.path(), "srggb16").unwrap();
        let (records, _) = Correlator::new(&cfg, &fx.map, &fx.log).run(&session).unwrap();
        assert_eq!(records[0].orientation, Orientation { code: 8, label: "Rotate 270 CW" });

        let out = fx.dir.path().join("export.csv");
        export_csv(&records, &cfg, &out, ExportMode::RawConvert).unwrap();
        let content = std::fs::read_to_string(&out).unwrap();
        assert!(!content.contains("Orientation"));
        assert!(!content.contains("Rotate 270 CW"));
    }

    #[test]
    fn test_empty_telemetry_is_fatal() {
        let fx = fixture(&[(100.0, 0)], 200.0);
        let cfg = test_cfg();
        let session = Session::open(fx.dir.path(), "srggb16").unwrap();
        let empty = TelemetryLog::parse("");
        let result = Correlator::new(&cfg, &fx.map, &empty).run(&session);
        assert!(result.is_err());
    }

    #[test]
    fn test_vehicle_datetime_formatting() {
        let offset = parse_utc_offset("-07:00").unwrap();
        // 2025-08-20 20:17:41.802 UTC
        let dt = vehicle_datetime(1755721061.802, offset).unwrap();
        assert_eq!(dt.format("%Y:%m:%d %H:%M:%S").to_string(), "2025:08:20 13:17:41");
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(parse_utc_offset("-07:00").unwrap().local_minus_utc(), -7 * 3600);
        assert_eq!(parse_utc_offset("+05:30").unwrap().local_minus_utc(), 5 * 3600 + 30 * 60);
        assert!(parse_utc_offset("seven").is_err());
    }

    #[test]
    fn test_hemisphere_refs() {
        assert_eq!(hemisphere(-37.5, "North", "South"), (37.5, "South"));
        assert_eq!(hemisphere(37.5, "North", "South"), (37.5, "North"));
        assert_eq!(hemisphere(0.0, "East", "West"), (0.0, "East"));
    }
}
