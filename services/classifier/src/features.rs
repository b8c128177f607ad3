//! Feature extraction from decoded raster images.
//!
//! Each classifier kind reduces an image to a handful of colour and
//! luminance statistics. All channel values are normalised to `[0, 1]`
//! by dividing the 8-bit value by 255, and every ratio carries a small
//! epsilon in its denominator so black images never divide by zero.

use image::RgbImage;
use thiserror::Error;

/// Fixed-length numeric summary of an image.
pub type FeatureVector = Vec<f64>;

/// Dimensionality of the mood (happy/sad) feature vector
pub const MOOD_DIMENSIONS: usize = 3;

/// Dimensionality of the team (3-way colour) feature vector
pub const TEAM_DIMENSIONS: usize = 4;

const EPSILON: f64 = 1e-9;

/// Errors that can occur while turning bytes into features
#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
}

/// Decode raw raster bytes (PNG or JPEG) into an RGB image.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, FeatureError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| FeatureError::Decode(e.to_string()))
}

/// Raw channel sums over one image, split into upper and lower halves.
#[derive(Debug, Default)]
struct ChannelSums {
    red: f64,
    green: f64,
    blue: f64,
    upper_brightness: f64,
    upper_pixels: f64,
    lower_brightness: f64,
    lower_pixels: f64,
    pixels: f64,
}

impl ChannelSums {
    fn collect(img: &RgbImage) -> Result<Self, FeatureError> {
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(FeatureError::EmptyImage { width, height });
        }

        let half = height / 2;
        let mut sums = Self::default();

        for (_, y, pixel) in img.enumerate_pixels() {
            let [r, g, b] = pixel.0.map(f64::from);
            let brightness = (r + g + b) / 3.0;

            sums.red += r;
            sums.green += g;
            sums.blue += b;

            if y < half {
                sums.upper_brightness += brightness;
                sums.upper_pixels += 1.0;
            } else {
                sums.lower_brightness += brightness;
                sums.lower_pixels += 1.0;
            }
        }

        sums.pixels = f64::from(width) * f64::from(height);
        Ok(sums)
    }

    fn channel_total(&self) -> f64 {
        self.red + self.green + self.blue
    }

    fn average_brightness(&self) -> f64 {
        self.channel_total() / (3.0 * self.pixels) / 255.0
    }

    fn half_average(sum: f64, count: f64) -> f64 {
        if count == 0.0 {
            0.0
        } else {
            sum / count / 255.0
        }
    }
}

/// Mood features: `[avg_brightness, lower_minus_upper_brightness, red_ratio]`.
///
/// The middle component is positive when the bottom half of the image is
/// brighter than the top half, which is where a smile or frown sits.
pub fn mood_features(img: &RgbImage) -> Result<FeatureVector, FeatureError> {
    let sums = ChannelSums::collect(img)?;

    let upper = ChannelSums::half_average(sums.upper_brightness, sums.upper_pixels);
    let lower = ChannelSums::half_average(sums.lower_brightness, sums.lower_pixels);
    let red_ratio = sums.red / (sums.channel_total() + EPSILON);

    Ok(vec![sums.average_brightness(), lower - upper, red_ratio])
}

/// Team features: `[red_ratio, green_ratio, blue_ratio, avg_brightness]`.
pub fn team_features(img: &RgbImage) -> Result<FeatureVector, FeatureError> {
    let sums = ChannelSums::collect(img)?;
    let total = sums.channel_total() + EPSILON;

    Ok(vec![
        sums.red / total,
        sums.green / total,
        sums.blue / total,
        sums.average_brightness(),
    ])
}
