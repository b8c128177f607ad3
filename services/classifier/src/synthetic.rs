//! Procedural rendering of labeled sample images.
//!
//! The same renderer backs the synthetic training corpus and the live
//! traffic emitted by the generator service, so a classifier trained on
//! the fallback corpus sees exactly the distribution it is later asked to
//! classify. Rendering is fully deterministic: a label always produces the
//! same 64x64 image.

use crate::kind::ClassifierKind;
use image::{ImageFormat, Rgb, RgbImage};
use rand::Rng;
use std::io::Cursor;

/// Width and height of every rendered sample
pub const IMAGE_SIZE: u32 = 64;

const HAPPY_BACKGROUND: Rgb<u8> = Rgb([255, 220, 80]);
const SAD_BACKGROUND: Rgb<u8> = Rgb([80, 80, 90]);
const FACE: Rgb<u8> = Rgb([255, 230, 150]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);
const TEAM_COLORS: [Rgb<u8>; 3] = [Rgb([255, 0, 0]), Rgb([0, 0, 255]), Rgb([0, 255, 0])];

const MOUTH_STROKE: f64 = 3.0;

/// Label index of a happy face
pub const HAPPY: usize = 1;
/// Label index of a sad face
pub const SAD: usize = 0;

/// Renders labeled samples for one classifier kind.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticGenerator {
    kind: ClassifierKind,
}

impl SyntheticGenerator {
    pub fn new(kind: ClassifierKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> ClassifierKind {
        self.kind
    }

    /// Draw a label: a fair coin for mood, uniform over three teams.
    pub fn sample_label<R: Rng>(&self, rng: &mut R) -> usize {
        match self.kind {
            ClassifierKind::Mood => {
                if rng.gen_bool(0.5) {
                    HAPPY
                } else {
                    SAD
                }
            }
            ClassifierKind::Team => rng.gen_range(0..TEAM_COLORS.len()),
        }
    }

    /// Render the image for `label`.
    ///
    /// Team labels beyond the known colours fall back to the last colour.
    pub fn produce(&self, label: usize) -> RgbImage {
        match self.kind {
            ClassifierKind::Mood => render_face(label == HAPPY),
            ClassifierKind::Team => render_team(label),
        }
    }
}

/// Warm background, round face, two eyes and a mouth arc whose sweep
/// encodes the mood.
pub fn render_face(happy: bool) -> RgbImage {
    let background = if happy { HAPPY_BACKGROUND } else { SAD_BACKGROUND };
    let mut img = RgbImage::from_pixel(IMAGE_SIZE, IMAGE_SIZE, background);

    fill_oval(&mut img, 6, 6, 52, 52, FACE);
    fill_oval(&mut img, 20, 24, 6, 6, BLACK);
    fill_oval(&mut img, 38, 24, 6, 6, BLACK);

    if happy {
        // Lower half of the ellipse: a smile.
        draw_arc(&mut img, 20, 30, 24, 16, 180.0, 180.0, BLACK);
    } else {
        // Upper half of the ellipse: a frown.
        draw_arc(&mut img, 20, 36, 24, 16, 0.0, 180.0, BLACK);
    }

    img
}

/// Neutral background, a solid team-coloured block and a yellow emblem.
pub fn render_team(team: usize) -> RgbImage {
    let color = TEAM_COLORS[team.min(TEAM_COLORS.len() - 1)];
    let mut img = RgbImage::from_pixel(IMAGE_SIZE, IMAGE_SIZE, WHITE);

    fill_rect(&mut img, 8, 8, IMAGE_SIZE - 16, IMAGE_SIZE - 16, color);
    fill_oval(&mut img, 22, 18, 20, 20, YELLOW);

    img
}

/// Encode a rendered image as PNG bytes for the wire.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}

fn fill_rect(img: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let x_end = (x + width).min(img.width());
    let y_end = (y + height).min(img.height());
    for py in y..y_end {
        for px in x..x_end {
            img.put_pixel(px, py, color);
        }
    }
}

/// Fill the ellipse inscribed in the box `(x, y, width, height)`.
fn fill_oval(img: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let rx = f64::from(width) / 2.0;
    let ry = f64::from(height) / 2.0;
    let cx = f64::from(x) + rx;
    let cy = f64::from(y) + ry;

    let x_end = (x + width).min(img.width());
    let y_end = (y + height).min(img.height());
    for py in y..y_end {
        for px in x..x_end {
            let dx = (f64::from(px) + 0.5 - cx) / rx;
            let dy = (f64::from(py) + 0.5 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                img.put_pixel(px, py, color);
            }
        }
    }
}

/// Stroke part of the ellipse inscribed in `(x, y, width, height)`.
///
/// Angles are in degrees, counter-clockwise from 3 o'clock with the y axis
/// pointing up, so `start = 180, extent = 180` is the lower half.
#[allow(clippy::too_many_arguments)]
fn draw_arc(
    img: &mut RgbImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    start_deg: f64,
    extent_deg: f64,
    color: Rgb<u8>,
) {
    let rx = f64::from(width) / 2.0;
    let ry = f64::from(height) / 2.0;
    let cx = f64::from(x) + rx;
    let cy = f64::from(y) + ry;
    let half_stroke = MOUTH_STROKE / 2.0;

    let steps = (extent_deg.abs() * 2.0).ceil() as u32;
    for step in 0..=steps {
        let angle = (start_deg + extent_deg * f64::from(step) / f64::from(steps)).to_radians();
        let ax = cx + rx * angle.cos();
        let ay = cy - ry * angle.sin();
        stamp_disc(img, ax, ay, half_stroke, color);
    }
}

fn stamp_disc(img: &mut RgbImage, cx: f64, cy: f64, radius: f64, color: Rgb<u8>) {
    let x_min = (cx - radius).floor().max(0.0) as u32;
    let y_min = (cy - radius).floor().max(0.0) as u32;
    let x_max = ((cx + radius).ceil() as u32).min(img.width());
    let y_max = ((cy + radius).ceil() as u32).min(img.height());

    for py in y_min..y_max {
        for px in x_min..x_max {
            let dx = f64::from(px) + 0.5 - cx;
            let dy = f64::from(py) + 0.5 - cy;
            if dx * dx + dy * dy <= radius * radius {
                img.put_pixel(px, py, color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{decode_image, mood_features};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_rendering_is_deterministic() {
        let generator = SyntheticGenerator::new(ClassifierKind::Mood);
        assert_eq!(generator.produce(HAPPY), generator.produce(HAPPY));

        let png_a = encode_png(&render_team(2)).unwrap();
        let png_b = encode_png(&render_team(2)).unwrap();
        assert_eq!(png_a, png_b);
    }

    #[test]
    fn test_face_geometry() {
        let happy = render_face(true);
        let sad = render_face(false);
        assert_eq!(happy.dimensions(), (IMAGE_SIZE, IMAGE_SIZE));

        assert_eq!(*happy.get_pixel(1, 1), HAPPY_BACKGROUND);
        assert_eq!(*sad.get_pixel(1, 1), SAD_BACKGROUND);
        assert_eq!(*happy.get_pixel(32, 12), FACE);
        assert_eq!(*happy.get_pixel(22, 26), BLACK);
        assert_eq!(*sad.get_pixel(41, 27), BLACK);

        // Smile bottoms out near y=46, frown peaks near y=36.
        assert_eq!(*happy.get_pixel(32, 45), BLACK);
        assert_eq!(*sad.get_pixel(32, 36), BLACK);
        assert_ne!(happy, sad);
    }

    #[test]
    fn test_smile_and_frown_shift_brightness_difference() {
        let happy = mood_features(&render_face(true)).unwrap();
        let sad = mood_features(&render_face(false)).unwrap();
        assert!(happy[0] > sad[0]);
        assert_ne!(happy[1], sad[1]);
    }

    #[test]
    fn test_team_colors() {
        for (team, color) in TEAM_COLORS.iter().enumerate() {
            let img = render_team(team);
            assert_eq!(*img.get_pixel(0, 0), WHITE);
            assert_eq!(*img.get_pixel(10, 50), *color);
            assert_eq!(*img.get_pixel(32, 28), YELLOW);
        }
    }

    #[test]
    fn test_png_round_trips_through_decoder() {
        let img = render_team(1);
        let decoded = decode_image(&encode_png(&img).unwrap()).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn test_label_draws_stay_in_domain() {
        let mut rng = StdRng::seed_from_u64(7);
        let mood = SyntheticGenerator::new(ClassifierKind::Mood);
        let team = SyntheticGenerator::new(ClassifierKind::Team);

        let mut seen = [0usize; 3];
        for _ in 0..300 {
            assert!(mood.sample_label(&mut rng) <= HAPPY);
            seen[team.sample_label(&mut rng)] += 1;
        }
        assert!(seen.iter().all(|&n| n > 0));
    }
}
