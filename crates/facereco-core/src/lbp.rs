//! Extended local binary pattern encoder.
//!
//! Turns an aligned grayscale face patch into a spatial uniform-pattern
//! histogram (Ahonen, Hadid and Pietikäinen, "Face Description with Local
//! Binary Patterns", 2006), using radius 2 and 8 circular sampling points.

use crate::types::{Descriptor, DESCRIPTOR_LEN, NUM_PATTERNS};
use image::GrayImage;
use thiserror::Error;

// --- Named constants ---
const LBP_RADIUS: u32 = 2;
const LBP_SAMPLING_POINTS: usize = 8;
const GRID_X: u32 = 7;
const GRID_Y: u32 = 7;
/// Bin shared by every non-uniform pattern.
const NON_UNIFORM_BIN: u8 = (NUM_PATTERNS - 1) as u8;

/// Maps an 8-bit code to its histogram bin: uniform codes (at most two
/// circular 0/1 transitions) get bins 0..57 in ascending order, the rest 58.
static UNIFORM_BINS: [u8; 256] = build_uniform_bins();

const fn build_uniform_bins() -> [u8; 256] {
    let mut table = [NON_UNIFORM_BIN; 256];
    let mut next_bin = 0u8;
    let mut code = 0usize;
    while code < 256 {
        let c = code as u8;
        if (c ^ c.rotate_left(1)).count_ones() <= 2 {
            table[code] = next_bin;
            next_bin += 1;
        }
        code += 1;
    }
    table
}

#[derive(Error, Debug)]
pub enum LbpError {
    #[error("face patch {width}x{height} too small, need at least {min}x{min}")]
    PatchTooSmall { width: u32, height: u32, min: u32 },
}

/// LBP codes of a face patch plus the descriptor built from them.
pub struct LbpImage {
    codes: GrayImage,
    descriptor: Descriptor,
}

impl LbpImage {
    /// Encode an aligned 8-bit grayscale face patch.
    pub fn encode(patch: &GrayImage) -> Result<Self, LbpError> {
        let min = 2 * LBP_RADIUS + GRID_X.max(GRID_Y);
        if patch.width() < min || patch.height() < min {
            return Err(LbpError::PatchTooSmall {
                width: patch.width(),
                height: patch.height(),
                min,
            });
        }

        let codes = extended_lbp(patch);
        let descriptor = spatial_histogram(&codes);

        Ok(Self { codes, descriptor })
    }

    /// The code image, 2 * radius smaller than the source on each axis.
    pub fn codes(&self) -> &GrayImage {
        &self.codes
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> Descriptor {
        self.descriptor
    }
}

/// Shorthand for encoding a patch straight to its descriptor.
pub fn encode(patch: &GrayImage) -> Result<Descriptor, LbpError> {
    LbpImage::encode(patch).map(LbpImage::into_descriptor)
}

/// Bilinear sampling offsets and weights for one circular neighbour.
struct Sample {
    fx: i64,
    fy: i64,
    cx: i64,
    cy: i64,
    w: [f32; 4],
}

impl Sample {
    fn new(n: usize) -> Self {
        let angle = 2.0 * std::f64::consts::PI * n as f64 / LBP_SAMPLING_POINTS as f64;
        let radius = LBP_RADIUS as f64;
        let x = (angle.cos() * radius) as f32;
        let y = (angle.sin() * -radius) as f32;

        let fx = x.floor();
        let fy = y.floor();
        let tx = x - fx;
        let ty = y - fy;

        Self {
            fx: fx as i64,
            fy: fy as i64,
            cx: x.ceil() as i64,
            cy: y.ceil() as i64,
            w: [
                (1.0 - tx) * (1.0 - ty),
                tx * (1.0 - ty),
                (1.0 - tx) * ty,
                tx * ty,
            ],
        }
    }
}

/// Compute the radius-2, 8-point LBP code of every interior pixel.
fn extended_lbp(img: &GrayImage) -> GrayImage {
    let r = LBP_RADIUS as i64;
    let (width, height) = (img.width() as i64, img.height() as i64);
    let mut result = GrayImage::new((width - 2 * r) as u32, (height - 2 * r) as u32);

    let px = |x: i64, y: i64| img.get_pixel(x as u32, y as u32)[0] as f32;

    for n in 0..LBP_SAMPLING_POINTS {
        let s = Sample::new(n);
        for y in r..height - r {
            for x in r..width - r {
                let t = s.w[0] * px(x + s.fx, y + s.fy)
                    + s.w[1] * px(x + s.cx, y + s.fy)
                    + s.w[2] * px(x + s.fx, y + s.cy)
                    + s.w[3] * px(x + s.cx, y + s.cy);
                let center = px(x, y);

                if t > center || (t - center).abs() < f32::EPSILON {
                    result.get_pixel_mut((x - r) as u32, (y - r) as u32)[0] |= 1 << n;
                }
            }
        }
    }

    result
}

/// True for the ten grid cells left out of the descriptor: the lower four
/// cells of the outer columns and the two upper-centre nose cells.
fn is_skipped_cell(row: u32, col: u32) -> bool {
    ((col == 0 || col == GRID_X - 1) && (3..=6).contains(&row)) || (col == 3 && (row == 2 || row == 3))
}

/// Build the 39-patch uniform histogram, normalised by the code image size.
fn spatial_histogram(codes: &GrayImage) -> Descriptor {
    let mut hist = vec![0.0f32; DESCRIPTOR_LEN];

    let cell_w = codes.width() / GRID_X;
    let cell_h = codes.height() / GRID_Y;

    let mut patch = 0usize;
    for row in 0..GRID_Y {
        for col in 0..GRID_X {
            if is_skipped_cell(row, col) {
                continue;
            }

            let base = patch * NUM_PATTERNS;
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    let code = codes.get_pixel(x, y)[0];
                    hist[base + UNIFORM_BINS[code as usize] as usize] += 1.0;
                }
            }

            patch += 1;
        }
    }

    let total = (codes.width() * codes.height()) as f32;
    for v in hist.iter_mut() {
        *v /= total;
    }

    Descriptor::from_values(hist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NUM_PATCHES;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    // Aligned face size used by the tracker upstream.
    const FACE_W: u32 = 130;
    const FACE_H: u32 = 151;

    fn random_patch(seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        GrayImage::from_fn(FACE_W, FACE_H, |_, _| image::Luma([rng.gen::<u8>()]))
    }

    #[test]
    fn test_uniform_table_has_58_uniform_codes() {
        let uniform = UNIFORM_BINS.iter().filter(|&&b| b != NON_UNIFORM_BIN).count();
        assert_eq!(uniform, 58);
        // Spot checks against the canonical uniform2 table.
        assert_eq!(UNIFORM_BINS[0], 0);
        assert_eq!(UNIFORM_BINS[4], 4);
        assert_eq!(UNIFORM_BINS[5], NON_UNIFORM_BIN);
        assert_eq!(UNIFORM_BINS[6], 5);
        assert_eq!(UNIFORM_BINS[255], 57);
    }

    #[test]
    fn test_skipped_cells_leave_39_patches() {
        let kept = (0..GRID_Y)
            .flat_map(|r| (0..GRID_X).map(move |c| (r, c)))
            .filter(|&(r, c)| !is_skipped_cell(r, c))
            .count();
        assert_eq!(kept, NUM_PATCHES);
    }

    #[test]
    fn test_code_image_shrinks_by_radius() {
        let lbp = LbpImage::encode(&random_patch(1)).unwrap();
        assert_eq!(lbp.codes().width(), FACE_W - 4);
        assert_eq!(lbp.codes().height(), FACE_H - 4);
    }

    #[test]
    fn test_flat_patch_single_bin_per_patch() {
        let flat = GrayImage::from_pixel(32, 32, image::Luma([90]));
        let lbp = LbpImage::encode(&flat).unwrap();
        let first = lbp.codes().get_pixel(0, 0)[0];
        assert!(lbp.codes().pixels().all(|p| p[0] == first));
        // Axis-aligned neighbours sample exactly the centre value.
        assert_eq!(first & 0b0101_0101, 0b0101_0101);

        let d = lbp.descriptor();
        assert_eq!(d.len(), DESCRIPTOR_LEN);
        let bin = UNIFORM_BINS[first as usize] as usize;
        for (i, v) in d.values().iter().enumerate() {
            if i % NUM_PATTERNS == bin {
                assert!(*v > 0.0);
            } else {
                assert_eq!(*v, 0.0);
            }
        }
    }

    #[test]
    fn test_vertical_edge_code() {
        // Left half dark, right half bright: pixels just left of the edge see
        // brighter neighbours to the east (bit 0).
        let patch = GrayImage::from_fn(32, 32, |x, _| image::Luma([if x < 16 { 10 } else { 200 }]));
        let lbp = LbpImage::encode(&patch).unwrap();
        // Code pixel x=13 maps to source x=15, whose east neighbour at x=17 is bright.
        let code = lbp.codes().get_pixel(13, 10)[0];
        assert_eq!(code & 1, 1);
        // Source x=17 sits in the bright half; its west neighbour (bit 4) at x=15 is dark.
        let code = lbp.codes().get_pixel(15, 10)[0];
        assert_eq!(code & (1 << 4), 0);
    }

    #[test]
    fn test_histogram_mass_matches_covered_area() {
        let lbp = LbpImage::encode(&random_patch(2)).unwrap();
        let (w, h) = (lbp.codes().width(), lbp.codes().height());
        let covered = (w / GRID_X) * (h / GRID_Y) * NUM_PATCHES as u32;
        let expected = covered as f32 / (w * h) as f32;
        let total: f32 = lbp.descriptor().values().iter().sum();
        assert!((total - expected).abs() < 1e-3, "total {total}, expected {expected}");
    }

    #[test]
    fn test_encode_deterministic() {
        let a = encode(&random_patch(3)).unwrap();
        let b = encode(&random_patch(3)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.distance(&b), 0.0);
    }

    #[test]
    fn test_different_faces_are_apart() {
        let a = encode(&random_patch(4)).unwrap();
        let b = encode(&random_patch(5)).unwrap();
        let d = a.distance(&b);
        assert!(d > 0.0);
        assert_eq!(d, b.distance(&a));
    }

    #[test]
    fn test_patch_too_small() {
        let tiny = GrayImage::new(8, 40);
        assert!(matches!(
            LbpImage::encode(&tiny),
            Err(LbpError::PatchTooSmall { width: 8, .. })
        ));
    }
}
