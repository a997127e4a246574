//! Color Pipeline
//!
//! YUV -> RGB conversion, HDR transfer functions and tone mapping.
//! `ColorUniforms` is laid out for a GPU uniform buffer; the CPU path
//! evaluates the same parameters per pixel.

use crate::app::DisplayConfig;
use crate::error::RenderError;
use crate::media::{ColorRange, ColorSpace, PixelFormat, TransferFunction, VideoFrame};

/// Reference white for SDR content in an HDR signal (ITU-R BT.2408)
pub const SDR_WHITE_NITS: f32 = 203.0;
/// PQ signal peak
pub const PQ_PEAK_NITS: f32 = 10000.0;
/// Nominal HLG display peak
pub const HLG_PEAK_NITS: f32 = 1000.0;

/// Display-relative level where the tone-mapping shoulder starts
const TONE_MAP_KNEE: f32 = 0.75;

// SMPTE ST 2084
const PQ_M1: f32 = 2610.0 / 16384.0;
const PQ_M2: f32 = 2523.0 / 4096.0 * 128.0;
const PQ_C1: f32 = 3424.0 / 4096.0;
const PQ_C2: f32 = 2413.0 / 4096.0 * 32.0;
const PQ_C3: f32 = 2392.0 / 4096.0 * 32.0;

// ARIB STD-B67
const HLG_A: f32 = 0.178_832_77;
const HLG_B: f32 = 0.284_668_92;
const HLG_C: f32 = 0.559_910_73;

/// BT.2020 to BT.709 primaries, linear light
pub const BT2020_TO_BT709: [[f32; 3]; 3] = [
    [1.6605, -0.5876, -0.0728],
    [-0.1246, 1.1329, -0.0083],
    [-0.0182, -0.1006, 1.1187],
];

const IDENTITY: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Luma coefficients (Kr, Kb)
pub fn luma_coefficients(space: ColorSpace) -> (f32, f32) {
    match space {
        ColorSpace::BT601 => (0.299, 0.114),
        ColorSpace::BT709 => (0.2126, 0.0722),
        ColorSpace::BT2020 => (0.2627, 0.0593),
    }
}

/// Y'CbCr -> R'G'B' matrix (rows R, G, B; columns Y, Cb, Cr) with chroma centered at 0
pub fn yuv_to_rgb_matrix(space: ColorSpace) -> [[f32; 3]; 3] {
    let (kr, kb) = luma_coefficients(space);
    let kg = 1.0 - kr - kb;
    [
        [1.0, 0.0, 2.0 - 2.0 * kr],
        [
            1.0,
            -(2.0 - 2.0 * kb) * kb / kg,
            -(2.0 - 2.0 * kr) * kr / kg,
        ],
        [1.0, 2.0 - 2.0 * kb, 0.0],
    ]
}

/// Offsets and scales that normalize code values to Y' in [0,1] and
/// chroma in [-0.5, 0.5]. Inputs are code values divided by (2^bits - 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeParams {
    pub y_offset: f32,
    pub y_scale: f32,
    pub c_offset: f32,
    pub c_scale: f32,
}

impl RangeParams {
    pub fn new(range: ColorRange, bit_depth: u32) -> Self {
        let max = ((1u32 << bit_depth) - 1) as f32;
        let shift = (1u32 << (bit_depth - 8)) as f32;
        let c_offset = 128.0 * shift / max;
        match range {
            ColorRange::Limited => Self {
                y_offset: 16.0 * shift / max,
                y_scale: max / (219.0 * shift),
                c_offset,
                c_scale: max / (224.0 * shift),
            },
            ColorRange::Full => Self {
                y_offset: 0.0,
                y_scale: 1.0,
                c_offset,
                c_scale: 1.0,
            },
        }
    }
}

/// PQ signal [0,1] -> absolute luminance in nits
pub fn pq_eotf(e: f32) -> f32 {
    let e = e.clamp(0.0, 1.0);
    let p = e.powf(1.0 / PQ_M2);
    let num = (p - PQ_C1).max(0.0);
    let den = PQ_C2 - PQ_C3 * p;
    PQ_PEAK_NITS * (num / den).powf(1.0 / PQ_M1)
}

/// Absolute luminance in nits -> PQ signal [0,1]
pub fn pq_inverse_eotf(nits: f32) -> f32 {
    let y = (nits / PQ_PEAK_NITS).clamp(0.0, 1.0);
    let p = y.powf(PQ_M1);
    ((PQ_C1 + PQ_C2 * p) / (1.0 + PQ_C3 * p)).powf(PQ_M2)
}

/// HLG signal [0,1] -> scene-linear [0,1]
pub fn hlg_inverse_oetf(e: f32) -> f32 {
    let e = e.clamp(0.0, 1.0);
    if e <= 0.5 {
        e * e / 3.0
    } else {
        ((e - HLG_C) / HLG_A).exp() / 12.0 + HLG_B / 12.0
    }
}

/// System gamma of the HLG OOTF for a display peak
pub fn hlg_system_gamma(peak_nits: f32) -> f32 {
    1.2 + 0.42 * (peak_nits / 1000.0).log10()
}

/// HLG R'G'B' -> display-linear RGB in nits (inverse OETF + OOTF)
pub fn hlg_eotf(rgb: [f32; 3], luma_weights: [f32; 4], peak_nits: f32) -> [f32; 3] {
    let scene = rgb.map(hlg_inverse_oetf);
    let ys = luma_weights[0] * scene[0] + luma_weights[1] * scene[1] + luma_weights[2] * scene[2];
    let gain = if ys > 0.0 {
        peak_nits * ys.powf(hlg_system_gamma(peak_nits) - 1.0)
    } else {
        0.0
    };
    scene.map(|c| c * gain)
}

/// Compress display-relative linear light into [0,1]: identity below the
/// knee, Reinhard shoulder above it
pub fn tone_map(x: f32) -> f32 {
    if x <= TONE_MAP_KNEE {
        return x.max(0.0);
    }
    let range = 1.0 - TONE_MAP_KNEE;
    let t = (x - TONE_MAP_KNEE) / range;
    TONE_MAP_KNEE + range * t / (1.0 + t)
}

/// sRGB encoding of linear [0,1]
pub fn srgb_oetf(l: f32) -> f32 {
    let l = l.clamp(0.0, 1.0);
    if l <= 0.003_130_8 {
        12.92 * l
    } else {
        1.055 * l.powf(1.0 / 2.4) - 0.055
    }
}

fn mul3(m: &[[f32; 3]; 3], v: [f32; 3]) -> [f32; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

fn pad_rows(m: [[f32; 3]; 3]) -> [[f32; 4]; 3] {
    m.map(|r| [r[0], r[1], r[2], 0.0])
}

fn unpad_rows(m: &[[f32; 4]; 3]) -> [[f32; 3]; 3] {
    m.map(|r| [r[0], r[1], r[2]])
}

/// Transfer encoding of the input signal
pub const TRANSFER_SDR: u32 = 0;
pub const TRANSFER_PQ: u32 = 1;
pub const TRANSFER_HLG: u32 = 2;

/// Output encoding of the swapchain
pub const OUTPUT_SDR: u32 = 0;
pub const OUTPUT_PQ: u32 = 1;

/// Per-frame color conversion parameters, std140-compatible
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ColorUniforms {
    /// Rows R, G, B; fourth column unused
    pub yuv_to_rgb: [[f32; 4]; 3],
    /// Linear-light gamut conversion; identity unless BT.2020 goes to an SDR output
    pub gamut: [[f32; 4]; 3],
    /// Kr, Kg, Kb of the source matrix, used by the HLG OOTF
    pub luma_weights: [f32; 4],
    pub y_offset: f32,
    pub y_scale: f32,
    pub c_offset: f32,
    pub c_scale: f32,
    pub transfer: u32,
    pub output: u32,
    pub display_peak_nits: f32,
    pub sdr_white_nits: f32,
}

impl ColorUniforms {
    pub fn new(
        range: ColorRange,
        space: ColorSpace,
        transfer: TransferFunction,
        format: PixelFormat,
        display: &DisplayConfig,
    ) -> Self {
        let params = RangeParams::new(range, format.bit_depth());
        let output = if display.hdr_output && transfer.is_hdr() {
            OUTPUT_PQ
        } else {
            OUTPUT_SDR
        };
        let gamut = if space == ColorSpace::BT2020 && output == OUTPUT_SDR {
            BT2020_TO_BT709
        } else {
            IDENTITY
        };
        let display_peak_nits = if output == OUTPUT_PQ {
            display.peak_nits
        } else {
            // SDR output maps reference white to the display's white
            SDR_WHITE_NITS
        };

        let (kr, kb) = luma_coefficients(space);

        Self {
            yuv_to_rgb: pad_rows(yuv_to_rgb_matrix(space)),
            gamut: pad_rows(gamut),
            luma_weights: [kr, 1.0 - kr - kb, kb, 0.0],
            y_offset: params.y_offset,
            y_scale: params.y_scale,
            c_offset: params.c_offset,
            c_scale: params.c_scale,
            transfer: match transfer {
                TransferFunction::SDR => TRANSFER_SDR,
                TransferFunction::PQ => TRANSFER_PQ,
                TransferFunction::HLG => TRANSFER_HLG,
            },
            output,
            display_peak_nits,
            sdr_white_nits: SDR_WHITE_NITS,
        }
    }

    pub fn for_frame(frame: &VideoFrame, display: &DisplayConfig) -> Self {
        Self::new(
            frame.color_range,
            frame.color_space,
            frame.transfer_function,
            frame.format,
            display,
        )
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Convert one sample. Inputs are code values normalized by the bit-depth
    /// maximum; output is encoded RGB in [0,1].
    pub fn convert(&self, y: f32, cb: f32, cr: f32) -> [f32; 3] {
        let y = (y - self.y_offset) * self.y_scale;
        let cb = (cb - self.c_offset) * self.c_scale;
        let cr = (cr - self.c_offset) * self.c_scale;
        let rgb = mul3(&unpad_rows(&self.yuv_to_rgb), [y, cb, cr]).map(|c| c.clamp(0.0, 1.0));

        let nits = match self.transfer {
            TRANSFER_PQ => rgb.map(pq_eotf),
            TRANSFER_HLG => hlg_eotf(rgb, self.luma_weights, HLG_PEAK_NITS),
            // SDR video is already display-referred; pass through
            _ => return rgb,
        };

        let linear = mul3(&unpad_rows(&self.gamut), nits);
        match self.output {
            OUTPUT_PQ => linear.map(|n| {
                let mapped = tone_map(n / self.display_peak_nits) * self.display_peak_nits;
                pq_inverse_eotf(mapped)
            }),
            _ => linear.map(|n| srgb_oetf(tone_map(n / self.display_peak_nits))),
        }
    }
}

/// Normalized sampler over a CPU frame
struct PlaneSampler<'a> {
    frame: &'a VideoFrame,
}

impl<'a> PlaneSampler<'a> {
    fn check(frame: &'a VideoFrame) -> Result<Self, RenderError> {
        let uv_height = frame.height.div_ceil(2) as usize;
        let uv_width = frame.width.div_ceil(2) as usize;
        let height = frame.height as usize;
        let width = frame.width as usize;
        let bytes = frame.format.bytes_per_sample();

        let need = |stride: u32, rows: usize, row_bytes: usize| {
            if rows == 0 {
                0
            } else {
                stride as usize * (rows - 1) + row_bytes
            }
        };
        let mut checks = vec![("Y", frame.y_plane.len(), need(frame.y_stride, height, width * bytes))];
        match frame.format {
            PixelFormat::YUV420P => {
                checks.push(("U", frame.u_plane.len(), need(frame.u_stride, uv_height, uv_width)));
                checks.push(("V", frame.v_plane.len(), need(frame.v_stride, uv_height, uv_width)));
            }
            PixelFormat::NV12 | PixelFormat::P010 => {
                checks.push((
                    "UV",
                    frame.u_plane.len(),
                    need(frame.u_stride, uv_height, uv_width * 2 * bytes),
                ));
            }
        }
        for (plane, actual, needed) in checks {
            if actual < needed {
                return Err(RenderError::PlaneTooSmall {
                    plane,
                    needed,
                    actual,
                });
            }
        }
        Ok(Self { frame })
    }

    fn sample(&self, x: usize, y: usize) -> (f32, f32, f32) {
        let f = self.frame;
        let (cx, cy) = (x / 2, y / 2);
        match f.format {
            PixelFormat::YUV420P => (
                f.y_plane[y * f.y_stride as usize + x] as f32 / 255.0,
                f.u_plane[cy * f.u_stride as usize + cx] as f32 / 255.0,
                f.v_plane[cy * f.v_stride as usize + cx] as f32 / 255.0,
            ),
            PixelFormat::NV12 => {
                let uv = cy * f.u_stride as usize + cx * 2;
                (
                    f.y_plane[y * f.y_stride as usize + x] as f32 / 255.0,
                    f.u_plane[uv] as f32 / 255.0,
                    f.u_plane[uv + 1] as f32 / 255.0,
                )
            }
            PixelFormat::P010 => {
                // 10 significant bits in the high end of little-endian u16
                let word = |plane: &[u8], at: usize| {
                    (u16::from_le_bytes([plane[at], plane[at + 1]]) >> 6) as f32 / 1023.0
                };
                let uv = cy * f.u_stride as usize + cx * 4;
                (
                    word(&f.y_plane, y * f.y_stride as usize + x * 2),
                    word(&f.u_plane, uv),
                    word(&f.u_plane, uv + 2),
                )
            }
        }
    }
}

/// Convert a CPU-resident frame to packed RGBA8
pub fn convert_frame_to_rgba(
    frame: &VideoFrame,
    uniforms: &ColorUniforms,
    out: &mut Vec<u8>,
) -> Result<(), RenderError> {
    let sampler = PlaneSampler::check(frame)?;
    let (width, height) = (frame.width as usize, frame.height as usize);
    out.clear();
    out.reserve(width * height * 4);

    for y in 0..height {
        for x in 0..width {
            let (luma, cb, cr) = sampler.sample(x, y);
            let rgb = uniforms.convert(luma, cb, cr);
            out.extend(rgb.map(|c| (c * 255.0 + 0.5) as u8));
            out.push(255);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f32 = 1.0 / 255.0;

    fn sdr(space: ColorSpace, range: ColorRange) -> ColorUniforms {
        ColorUniforms::new(
            range,
            space,
            TransferFunction::SDR,
            PixelFormat::YUV420P,
            &DisplayConfig::default(),
        )
    }

    fn assert_rgb(actual: [f32; 3], expected: [f32; 3]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() <= TOLERANCE, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn test_limited_bt709_levels() {
        let u = sdr(ColorSpace::BT709, ColorRange::Limited);
        let c = 128.0 / 255.0;
        assert_rgb(u.convert(16.0 / 255.0, c, c), [0.0, 0.0, 0.0]);
        assert_rgb(u.convert(235.0 / 255.0, c, c), [1.0, 1.0, 1.0]);

        let gray = u.convert(128.0 / 255.0, c, c);
        assert!((gray[0] - gray[1]).abs() < 1e-6 && (gray[1] - gray[2]).abs() < 1e-6);
        assert_rgb(gray, [112.0 / 219.0; 3]);
    }

    #[test]
    fn test_full_range_bt601_red() {
        // Full-range BT.601 pure red: Y=76, Cb=85, Cr=255
        let u = sdr(ColorSpace::BT601, ColorRange::Full);
        let rgb = u.convert(76.0 / 255.0, 85.0 / 255.0, 255.0 / 255.0);
        assert!(rgb[0] > 0.98);
        assert!(rgb[1] < 0.02 && rgb[2] < 0.02);
    }

    #[test]
    fn test_matrix_rows_preserve_gray() {
        for space in [ColorSpace::BT601, ColorSpace::BT709, ColorSpace::BT2020] {
            let m = yuv_to_rgb_matrix(space);
            let rgb = mul3(&m, [0.5, 0.0, 0.0]);
            assert_rgb(rgb, [0.5; 3]);
        }
    }

    #[test]
    fn test_ten_bit_limited_offsets() {
        let p = RangeParams::new(ColorRange::Limited, 10);
        assert!((p.y_offset - 64.0 / 1023.0).abs() < 1e-6);
        assert!((p.y_scale - 1023.0 / 876.0).abs() < 1e-5);
        assert!((p.c_offset - 512.0 / 1023.0).abs() < 1e-6);
    }

    #[test]
    fn test_pq_reference_points() {
        assert_eq!(pq_eotf(0.0), 0.0);
        assert!((pq_eotf(1.0) - 10000.0).abs() < 1.0);
        // 100 nits sits near 0.508 in PQ
        assert!((pq_eotf(0.508) - 100.0).abs() < 2.0);
        assert!((pq_eotf(pq_inverse_eotf(203.0)) - 203.0).abs() < 0.5);
    }

    #[test]
    fn test_hlg_curve() {
        assert!((hlg_inverse_oetf(0.5) - 1.0 / 12.0).abs() < 1e-6);
        assert!((hlg_inverse_oetf(1.0) - 1.0).abs() < 1e-3);
        assert!((hlg_system_gamma(1000.0) - 1.2).abs() < 1e-6);
        let (kr, kb) = luma_coefficients(ColorSpace::BT2020);
        let white = hlg_eotf([1.0; 3], [kr, 1.0 - kr - kb, kb, 0.0], 1000.0);
        assert!((white[0] - 1000.0).abs() < 2.0);
    }

    #[test]
    fn test_tone_map_shoulder() {
        assert_eq!(tone_map(0.5), 0.5);
        assert!(tone_map(1.0) < 1.0);
        assert!(tone_map(50.0) < 1.0);
        assert!(tone_map(2.0) > tone_map(1.0));
    }

    #[test]
    fn test_pq_to_sdr_stays_in_range() {
        let u = ColorUniforms::new(
            ColorRange::Limited,
            ColorSpace::BT2020,
            TransferFunction::PQ,
            PixelFormat::P010,
            &DisplayConfig::default(),
        );
        assert_eq!(u.output, OUTPUT_SDR);
        assert_eq!(u.gamut, pad_rows(BT2020_TO_BT709));
        let c = 512.0 / 1023.0;
        let peak = u.convert(940.0 / 1023.0, c, c);
        assert!(peak.iter().all(|v| (0.0..=1.0).contains(v)));
        let black = u.convert(64.0 / 1023.0, c, c);
        assert_rgb(black, [0.0; 3]);
    }

    #[test]
    fn test_hdr_output_keeps_pq() {
        let display = DisplayConfig {
            peak_nits: 1000.0,
            hdr_output: true,
        };
        let u = ColorUniforms::new(
            ColorRange::Limited,
            ColorSpace::BT2020,
            TransferFunction::PQ,
            PixelFormat::P010,
            &display,
        );
        assert_eq!(u.output, OUTPUT_PQ);
        assert_eq!(u.gamut, pad_rows(IDENTITY));
        assert_eq!(std::mem::size_of::<ColorUniforms>(), 144);
        assert_eq!(u.as_bytes().len(), 144);
    }

    #[test]
    fn test_convert_nv12_frame() {
        let mut frame = VideoFrame::solid(1, 2, 2, 235, 128, 128);
        frame.format = PixelFormat::NV12;
        frame.u_plane = vec![128, 128];
        frame.u_stride = 2;
        frame.v_plane.clear();

        let mut out = Vec::new();
        let u = ColorUniforms::for_frame(&frame, &DisplayConfig::default());
        convert_frame_to_rgba(&frame, &u, &mut out).unwrap();
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|&b| b == 255));
    }

    #[test]
    fn test_convert_p010_frame() {
        let mut frame = VideoFrame::solid(1, 2, 2, 0, 0, 0);
        frame.format = PixelFormat::P010;
        let word = |v: u16| (v << 6).to_le_bytes();
        frame.y_plane = [word(64); 4].concat();
        frame.y_stride = 4;
        frame.u_plane = [word(512), word(512)].concat();
        frame.u_stride = 4;
        frame.v_plane.clear();

        let mut out = Vec::new();
        let u = ColorUniforms::for_frame(&frame, &DisplayConfig::default());
        convert_frame_to_rgba(&frame, &u, &mut out).unwrap();
        assert_eq!(&out[..4], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_short_plane_rejected() {
        let mut frame = VideoFrame::solid(1, 4, 4, 16, 128, 128);
        frame.v_plane.truncate(1);
        let u = ColorUniforms::for_frame(&frame, &DisplayConfig::default());
        let err = convert_frame_to_rgba(&frame, &u, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, RenderError::PlaneTooSmall { plane: "V", .. }));
    }
}
