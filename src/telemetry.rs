use crate::timemap::interp_sorted;
use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;

/// Vehicle attitude at one log timestamp, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attitude {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

/// Vehicle position at one log timestamp. Altitude is meters as reported
/// by the source (MSL for the flight computer logs observed so far).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

/// GPS accuracy figures (`GPA` records). Parsed and retained, not yet
/// consumed by the correlator.
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(dead_code)]
pub struct Accuracy {
    pub ts: f64,
    pub v_dop: f64,
    pub h_acc: f64,
    pub v_acc: f64,
    pub s_acc: f64,
    pub y_acc: f64,
}

/// Time-indexed attitude and position series parsed from a vehicle
/// telemetry log (one line per received message:
/// `{recv_time:.3f} TYPE {Key : value, Key : value, ...}`).
///
/// Samples are kept in log emission order. They are assumed, not verified,
/// to be time-ascending; an out-of-order log passes through unmodified and
/// interpolation results against it are unspecified.
pub struct TelemetryLog {
    att_ts: Vec<f64>,
    rolls: Vec<f64>,
    pitches: Vec<f64>,
    yaws: Vec<f64>,
    pos_ts: Vec<f64>,
    lats: Vec<f64>,
    lons: Vec<f64>,
    alts: Vec<f64>,
    accuracies: Vec<Accuracy>,
}

struct LineParser {
    line_re: Regex,
    field_re: Regex,
}

impl LineParser {
    fn new() -> Self {
        LineParser {
            line_re: Regex::new(r"^(?P<ts>\d+\.\d+) (?P<type>[A-Z0-9]+) \{(?P<body>.*)\}\s*$")
                .expect("line regex"),
            field_re: Regex::new(r"(?P<key>[A-Za-z0-9_]+)\s*:\s*(?P<val>[^,}]+)").expect("field regex"),
        }
    }

    fn parse<'a>(&self, line: &'a str) -> Option<(f64, &'a str, &'a str)> {
        let caps = self.line_re.captures(line)?;
        let ts: f64 = caps.name("ts")?.as_str().parse().ok()?;
        let ty = caps.name("type")?.as_str();
        let body = caps.name("body")?.as_str();
        Some((ts, ty, body))
    }

    fn field(&self, body: &str, key: &str) -> Option<f64> {
        self.field_re.captures_iter(body).find_map(|caps| {
            if &caps["key"] == key {
                caps["val"].trim().parse().ok()
            } else {
                None
            }
        })
    }
}

impl TelemetryLog {
    pub fn open(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading telemetry log {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let parser = LineParser::new();

        let mut log = TelemetryLog {
            att_ts: Vec::new(),
            rolls: Vec::new(),
            pitches: Vec::new(),
            yaws: Vec::new(),
            pos_ts: Vec::new(),
            lats: Vec::new(),
            lons: Vec::new(),
            alts: Vec::new(),
            accuracies: Vec::new(),
        };

        for line in content.lines() {
            let Some((ts, ty, body)) = parser.parse(line) else {
                continue;
            };
            match ty {
                "ATT" => {
                    let fields = (
                        parser.field(body, "Roll"),
                        parser.field(body, "Pitch"),
                        parser.field(body, "Yaw"),
                    );
                    if let (Some(roll), Some(pitch), Some(yaw)) = fields {
                        log.att_ts.push(ts);
                        log.rolls.push(roll);
                        log.pitches.push(pitch);
                        log.yaws.push(yaw);
                    } else {
                        tracing::warn!("ATT record at {ts:.3} missing fields, skipped");
                    }
                }
                "POS" => {
                    let fields = (
                        parser.field(body, "Lat"),
                        parser.field(body, "Lng"),
                        parser.field(body, "Alt"),
                    );
                    if let (Some(lat), Some(lon), Some(alt)) = fields {
                        log.pos_ts.push(ts);
                        log.lats.push(lat);
                        log.lons.push(lon);
                        log.alts.push(alt);
                    } else {
                        tracing::warn!("POS record at {ts:.3} missing fields, skipped");
                    }
                }
                "GPA" => {
                    let fields = (
                        parser.field(body, "VDop"),
                        parser.field(body, "HAcc"),
                        parser.field(body, "VAcc"),
                        parser.field(body, "SAcc"),
                        parser.field(body, "YAcc"),
                    );
                    if let (Some(v_dop), Some(h_acc), Some(v_acc), Some(s_acc), Some(y_acc)) = fields {
                        log.accuracies.push(Accuracy { ts, v_dop, h_acc, v_acc, s_acc, y_acc });
                    } else {
                        tracing::warn!("GPA record at {ts:.3} missing fields, skipped");
                    }
                }
                // Flight logs carry dozens of other record types; only the
                // ones above matter here.
                _ => {}
            }
        }

        log
    }

    pub fn attitude_count(&self) -> usize {
        self.att_ts.len()
    }

    pub fn position_count(&self) -> usize {
        self.pos_ts.len()
    }

    pub fn attitude_timestamps(&self) -> &[f64] {
        &self.att_ts
    }

    pub fn position_timestamps(&self) -> &[f64] {
        &self.pos_ts
    }

    /// Per-axis linear interpolation of attitude at `ts`, clamped to the
    /// boundary samples outside the series range.
    ///
    /// Caveat: roll and yaw are circular quantities and this interpolation
    /// is not wrap-aware. Two adjacent samples straddling the ±180° wrap
    /// (179° then −179°) interpolate through 0°, not ±180°. This matches
    /// the long-standing processing behavior; use
    /// [`attitude_interp_wrapped`](Self::attitude_interp_wrapped) to opt
    /// into wrap handling.
    pub fn attitude_interp(&self, ts: f64) -> Attitude {
        Attitude {
            roll: interp_sorted(ts, &self.att_ts, &self.rolls),
            pitch: interp_sorted(ts, &self.att_ts, &self.pitches),
            yaw: interp_sorted(ts, &self.att_ts, &self.yaws),
        }
    }

    /// Wrap-aware variant of [`attitude_interp`](Self::attitude_interp):
    /// roll and yaw are unwrapped across ±180° before interpolating, then
    /// normalized back to (−180°, 180°].
    pub fn attitude_interp_wrapped(&self, ts: f64) -> Attitude {
        Attitude {
            roll: interp_angle(ts, &self.att_ts, &self.rolls),
            pitch: interp_sorted(ts, &self.att_ts, &self.pitches),
            yaw: interp_angle(ts, &self.att_ts, &self.yaws),
        }
    }

    /// Per-axis linear interpolation of position at `ts`, clamped to the
    /// boundary samples outside the series range.
    pub fn position_interp(&self, ts: f64) -> Position {
        Position {
            lat: interp_sorted(ts, &self.pos_ts, &self.lats),
            lon: interp_sorted(ts, &self.pos_ts, &self.lons),
            alt: interp_sorted(ts, &self.pos_ts, &self.alts),
        }
    }
}

fn interp_angle(ts: f64, xs: &[f64], angles: &[f64]) -> f64 {
    let mut unwrapped = Vec::with_capacity(angles.len());
    let mut offset = 0.0;
    for (i, &a) in angles.iter().enumerate() {
        if i > 0 {
            let delta = a - angles[i - 1];
            if delta > 180.0 {
                offset -= 360.0;
            } else if delta < -180.0 {
                offset += 360.0;
            }
        }
        unwrapped.push(a + offset);
    }
    let mut v = interp_sorted(ts, xs, &unwrapped);
    while v > 180.0 {
        v -= 360.0;
    }
    while v <= -180.0 {
        v += 360.0;
    }
    v
}

/// Convert a GPS week number and millisecond-of-week pair to UNIX seconds,
/// accounting for the current 18 leap seconds.
#[allow(dead_code)]
pub fn gps_time_to_unix(week: u32, ms_of_week: u64) -> f64 {
    const GPS_EPOCH_UNIX: f64 = 315_964_800.0; // 1980-01-06T00:00:00Z
    const LEAP_SECONDS: f64 = 18.0;
    GPS_EPOCH_UNIX + week as f64 * 604_800.0 + ms_of_week as f64 / 1000.0 - LEAP_SECONDS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn att_line(ts: f64, roll: f64, pitch: f64, yaw: f64) -> String {
        format!("{ts:.3} ATT {{DesRoll : 0.0, Roll : {roll}, Pitch : {pitch}, Yaw : {yaw}}}")
    }

    fn pos_line(ts: f64, lat: f64, lon: f64, alt: f64) -> String {
        format!("{ts:.3} POS {{Lat : {lat}, Lng : {lon}, Alt : {alt}, RelHomeAlt : 1.0}}")
    }

    #[test]
    fn test_attitude_interp_linear() {
        let content = [att_line(0.0, 0.0, 0.0, 0.0), att_line(10.0, 2.0, 4.0, 10.0)].join("\n");
        let log = TelemetryLog::parse(&content);
        let att = log.attitude_interp(5.0);
        assert_eq!(att.yaw, 5.0);
        assert_eq!(att.roll, 1.0);
        assert_eq!(att.pitch, 2.0);
    }

    #[test]
    fn test_attitude_interp_wrap_defect_preserved() {
        // 179° -> -179° crosses the wrap; the default interpolation goes
        // through 0° rather than ±180°, and must keep doing so.
        let content = [att_line(0.0, 0.0, 0.0, 179.0), att_line(10.0, 0.0, 0.0, -179.0)].join("\n");
        let log = TelemetryLog::parse(&content);
        assert_eq!(log.attitude_interp(5.0).yaw, 0.0);
    }

    #[test]
    fn test_attitude_interp_wrapped_variant() {
        let content = [att_line(0.0, 0.0, 0.0, 179.0), att_line(10.0, 0.0, 0.0, -179.0)].join("\n");
        let log = TelemetryLog::parse(&content);
        let yaw = log.attitude_interp_wrapped(5.0).yaw;
        assert!((yaw.abs() - 180.0).abs() < 1e-9, "expected ±180, got {yaw}");
    }

    #[test]
    fn test_position_interp_and_clamp() {
        let content = [pos_line(0.0, 10.0, 20.0, 100.0), pos_line(10.0, 11.0, 21.0, 200.0)].join("\n");
        let log = TelemetryLog::parse(&content);

        let mid = log.position_interp(5.0);
        assert_eq!(mid.lat, 10.5);
        assert_eq!(mid.lon, 20.5);
        assert_eq!(mid.alt, 150.0);

        // Out of range clamps to the boundary sample.
        assert_eq!(log.position_interp(-5.0).alt, 100.0);
        assert_eq!(log.position_interp(50.0).alt, 200.0);
    }

    #[test]
    fn test_unknown_and_malformed_records_ignored() {
        let content = [
            "100.000 MSG {Message : EKF3 IMU1 MAG0 in-flight yaw alignment complete}".to_string(),
            "not a log line at all".to_string(),
            "101.000 ATT {Roll : 1.0}".to_string(), // missing Pitch/Yaw, skipped
            att_line(102.0, 1.0, 2.0, 3.0),
            "103.000 GPA {VDop : 0.8, HAcc : 0.4, VAcc : 0.6, SAcc : 0.2, YAcc : 1.0}".to_string(),
        ]
        .join("\n");
        let log = TelemetryLog::parse(&content);
        assert_eq!(log.attitude_count(), 1);
        assert_eq!(log.position_count(), 0);
        assert_eq!(log.accuracies.len(), 1);
        assert_eq!(log.accuracies[0].h_acc, 0.4);
    }

    #[test]
    fn test_out_of_order_samples_pass_through() {
        let content = [att_line(10.0, 0.0, 0.0, 10.0), att_line(0.0, 0.0, 0.0, 0.0)].join("\n");
        let log = TelemetryLog::parse(&content);
        // Emission order is preserved exactly; no re-sort happens.
        assert_eq!(log.attitude_timestamps(), &[10.0, 0.0]);
    }

    #[test]
    fn test_gps_time_to_unix() {
        // GPS week 0, 18 s into the week lands back on the GPS epoch once
        // leap seconds are removed.
        assert_eq!(gps_time_to_unix(0, 18_000), 315_964_800.0);
    }
}
