use crate::session::FrameMetadata;
use anyhow::{bail, Context, Result};
use nalgebra::Matrix3;

/// Fixed denominator used for all rational-encoded calibration values.
pub const RATIONAL_DEN: u32 = 10_000;

/// sRGB (D65) linear RGB -> CIE XYZ, Lindbloom's matrix. Composed with the
/// device CCM and white-balance gains, then inverted, to obtain the
/// camera-native -> XYZ mapping raw processors expect.
const RGB_TO_XYZ: [f64; 9] = [
    0.4124564, 0.3575761, 0.1804375,
    0.2126729, 0.7151522, 0.0721750,
    0.0193339, 0.1191920, 0.9503041,
];

/// Signed rational with the fixed calibration denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SRational {
    pub num: i32,
    pub den: u32,
}

impl SRational {
    fn encode(value: f64) -> SRational {
        SRational { num: (value * RATIONAL_DEN as f64).round() as i32, den: RATIONAL_DEN }
    }
}

/// Everything downstream raw processing needs to render one frame:
/// black levels, DNG-style color matrix, as-shot white balance, exposure,
/// and a unique frame identifier.
#[derive(Debug, Clone)]
pub struct FrameCalibration {
    pub bit_depth: u8,
    pub black_levels: Vec<u16>,
    pub white_level: u16,
    pub color_matrix: [SRational; 9],
    pub as_shot_neutral: [SRational; 3],
    pub unique_id: String,
    /// Shutter speed as 1/N seconds.
    pub shutter: (u32, u32),
    pub iso: u32,
}

impl FrameCalibration {
    pub fn compute(meta: &FrameMetadata, raw_format: &str, cam: u8, iso_base: u32) -> Result<Self> {
        let bit_depth = bit_depth_from_format(raw_format)?;
        let shift = 16 - bit_depth as u32;

        // Raw samples are stored left-justified in 16-bit containers; the
        // declared black levels shift down by the same amount the pixel
        // data does.
        let black_levels: Vec<u16> =
            meta.sensor_black_levels.iter().map(|v| v >> shift).collect();

        let color_matrix = color_matrix(&meta.colour_correction_matrix, meta.colour_gains)?;
        let as_shot_neutral = as_shot_neutral(meta.colour_gains);

        Ok(FrameCalibration {
            bit_depth,
            black_levels,
            white_level: ((1u32 << bit_depth) - 1) as u16,
            color_matrix,
            as_shot_neutral,
            unique_id: raw_data_unique_id(meta.sensor_timestamp, cam),
            shutter: shutter_rational(meta.exposure_time)?,
            iso: (meta.analogue_gain * meta.digital_gain * iso_base as f64).round() as u32,
        })
    }
}

/// Sensor bit depth from the raw format name, e.g. `SRGGB12` -> 12.
pub fn bit_depth_from_format(format: &str) -> Result<u8> {
    let digits: String = format.chars().filter(|c| c.is_ascii_digit()).collect();
    let depth: u8 = digits
        .parse()
        .with_context(|| format!("no bit depth in raw format {format:?}"))?;
    if depth == 0 || depth > 16 {
        bail!("unsupported bit depth {depth} in raw format {format:?}");
    }
    Ok(depth)
}

/// DNG-style color matrix: invert `RGB_TO_XYZ . CCM . diag(gain_r, 1,
/// gain_b)` and encode each element as a rational.
pub fn color_matrix(ccm: &[f64; 9], gains: [f64; 2]) -> Result<[SRational; 9]> {
    let rgb_to_xyz = Matrix3::from_row_slice(&RGB_TO_XYZ);
    let ccm = Matrix3::from_row_slice(ccm);
    let gain = Matrix3::from_diagonal(&nalgebra::Vector3::new(gains[0], 1.0, gains[1]));

    let composed = rgb_to_xyz * ccm * gain;
    let Some(inverse) = composed.try_inverse() else {
        bail!("colour correction matrix composition is singular");
    };

    let mut out = [SRational { num: 0, den: RATIONAL_DEN }; 9];
    for (i, v) in inverse.transpose().as_slice().iter().enumerate() {
        // nalgebra stores column-major; transpose gives row-major order.
        out[i] = SRational::encode(*v);
    }
    Ok(out)
}

/// As-shot white balance from the red/blue colour gains: neutral is the
/// reciprocal of each gain, green fixed at 1.
pub fn as_shot_neutral(gains: [f64; 2]) -> [SRational; 3] {
    let den = RATIONAL_DEN as f64;
    [
        SRational { num: RATIONAL_DEN as i32, den: (gains[0] * den).round() as u32 },
        SRational { num: RATIONAL_DEN as i32, den: RATIONAL_DEN },
        SRational { num: RATIONAL_DEN as i32, den: (gains[1] * den).round() as u32 },
    ]
}

/// Unique per-frame identifier: sensor timestamp zero-padded to 14 digits
/// plus the camera ordinal.
pub fn raw_data_unique_id(sensor_timestamp: u64, cam: u8) -> String {
    format!("{sensor_timestamp:014}c{cam:1}")
}

/// Exposure in microseconds to a 1/N shutter-speed rational.
pub fn shutter_rational(exposure_us: u32) -> Result<(u32, u32)> {
    if exposure_us == 0 {
        bail!("zero exposure time");
    }
    let seconds = exposure_us as f64 * 1e-6;
    Ok((1, (1.0 / seconds).round() as u32))
}

/// Focal-plane resolution rationals (pixels per unit) from the sensor's
/// active pixel grid and image area in millimeters.
#[allow(dead_code)]
pub fn focal_plane_resolution(pixels: (u32, u32), area_mm: (f64, f64)) -> [(u32, u32); 2] {
    [
        (pixels.0 * 10 * 1000, (area_mm.0 * 1000.0).round() as u32),
        (pixels.1 * 10 * 1000, (area_mm.1 * 1000.0).round() as u32),
    ]
}
