//! Camera RAW input. Decoding needs the `raw` cargo feature.

use image::RgbaImage;

use super::NormalizeError;

pub const RAW_EXTENSIONS: &[&str] = &["arw", "dng", "cr2", "nef", "raf", "orf", "rw2"];

/// Whether this build can decode camera RAW files.
pub fn raw_decoding_available() -> bool {
    cfg!(feature = "raw")
}

pub fn is_raw_extension(ext: &str) -> bool {
    RAW_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

#[cfg(not(feature = "raw"))]
pub(crate) fn decode_raw(
    _bytes: &[u8],
    _max_dimension: u32,
    extension: &str,
) -> Result<RgbaImage, NormalizeError> {
    Err(NormalizeError::Unsupported {
        extension: extension.to_ascii_lowercase(),
    })
}

/// Prefers the largest embedded JPEG preview, then a draft decode of the sensor data.
/// Orientation is left as stored.
#[cfg(feature = "raw")]
pub(crate) fn decode_raw(
    bytes: &[u8],
    max_dimension: u32,
    extension: &str,
) -> Result<RgbaImage, NormalizeError> {
    use super::normalize::{fit_within_size, flatten_alpha, resize_rgba};
    use tracing::debug;

    let mut small_preview = None;
    if let Some(preview) = largest_embedded_jpeg(bytes) {
        match image::load_from_memory_with_format(preview, image::ImageFormat::Jpeg) {
            Ok(img) if img.width().max(img.height()) >= max_dimension => {
                debug!(extension, width = img.width(), height = img.height(), "raw: using preview");
                let img = flatten_alpha(img);
                let (w, h) = fit_within_size(img.width(), img.height(), max_dimension);
                return resize_rgba(&img, w, h);
            }
            Ok(img) => small_preview = Some(img),
            Err(err) => debug!(extension, error = %err, "raw: preview unreadable"),
        }
    }

    let sensor = match draft::decode_sensor(bytes, max_dimension) {
        Ok(img) => img,
        Err(err) => match small_preview {
            Some(img) => {
                debug!(extension, error = %err, "raw: sensor decode failed, using small preview");
                flatten_alpha(img)
            }
            None => return Err(err),
        },
    };
    let (w, h) = fit_within_size(sensor.width(), sensor.height(), max_dimension);
    resize_rgba(&sensor, w, h)
}

/// Finds the biggest SOI..EOI span in the container.
#[cfg(any(feature = "raw", test))]
fn largest_embedded_jpeg(buffer: &[u8]) -> Option<&[u8]> {
    const SOI: &[u8] = b"\xff\xd8\xff";
    const EOI: &[u8] = b"\xff\xd9";

    let mut best: Option<&[u8]> = None;
    let mut pos = 0;
    while pos + SOI.len() <= buffer.len() {
        if !buffer[pos..].starts_with(SOI) {
            pos += 1;
            continue;
        }
        let Some(end) = buffer[pos..]
            .windows(EOI.len())
            .position(|w| w == EOI)
            .map(|p| pos + p + EOI.len())
        else {
            break;
        };
        let span = &buffer[pos..end];
        if best.is_none_or(|b| span.len() > b.len()) {
            best = Some(span);
        }
        pos = end;
    }
    best
}

#[cfg(feature = "raw")]
mod draft {
    use std::io::Cursor;

    use image::RgbaImage;

    use super::NormalizeError;

    /// Half-resolution CFA binning, skipping cells when far above the target size.
    pub(super) fn decode_sensor(bytes: &[u8], max_dimension: u32) -> Result<RgbaImage, NormalizeError> {
        let raw = rawloader::decode(&mut Cursor::new(bytes))
            .map_err(|err| NormalizeError::Decode(format!("RAW decode failed: {err:?}")))?;

        let samples: Vec<f32> = match &raw.data {
            rawloader::RawImageData::Integer(values) => values.iter().map(|&v| f32::from(v)).collect(),
            rawloader::RawImageData::Float(values) => values.clone(),
        };
        let width = raw.width;
        let height = raw.height;
        if width < 2 || height < 2 || samples.len() < width * height * raw.cpp {
            return Err(NormalizeError::Decode("RAW image has no usable sensor data".into()));
        }

        let black = f32::from(raw.blacklevels[0]);
        let white = f32::from(raw.whitelevels[0]).max(black + 1.0);
        let wb = white_balance(raw.wb_coeffs);

        let cells_w = width / 2;
        let cells_h = height / 2;
        let step = (cells_w.max(cells_h) / (max_dimension as usize).max(1)).max(1);
        let out_w = cells_w.div_ceil(step);
        let out_h = cells_h.div_ceil(step);

        let mut out = RgbaImage::new(out_w as u32, out_h as u32);
        for oy in 0..out_h {
            for ox in 0..out_w {
                let row = oy * step * 2;
                let col = ox * step * 2;
                let mut sums = [0f32; 3];
                let mut counts = [0f32; 3];
                for dy in 0..2 {
                    for dx in 0..2 {
                        let (r, c) = (row + dy, col + dx);
                        if r >= height || c >= width {
                            continue;
                        }
                        if raw.cpp >= 3 {
                            let base = (r * width + c) * raw.cpp;
                            for ch in 0..3 {
                                sums[ch] += samples[base + ch];
                                counts[ch] += 1.0;
                            }
                        } else {
                            let color = raw.cfa.color_at(r, c);
                            let ch = if color == 3 { 1 } else { color.min(2) };
                            sums[ch] += samples[r * width + c];
                            counts[ch] += 1.0;
                        }
                    }
                }
                let mut px = [0u8; 4];
                for ch in 0..3 {
                    let avg = if counts[ch] > 0.0 { sums[ch] / counts[ch] } else { black };
                    let linear = ((avg - black) / (white - black) * wb[ch]).clamp(0.0, 1.0);
                    px[ch] = (linear.powf(1.0 / 2.2) * 255.0).round() as u8;
                }
                px[3] = 255;
                out.put_pixel(ox as u32, oy as u32, image::Rgba(px));
            }
        }
        Ok(out)
    }

    /// Normalized so green is 1.0; missing or bogus coefficients become neutral.
    fn white_balance(coeffs: [f32; 4]) -> [f32; 3] {
        let valid = |v: f32| v.is_finite() && v > 0.0;
        if !coeffs[..3].iter().all(|&v| valid(v)) {
            return [1.0; 3];
        }
        let g = coeffs[1];
        [coeffs[0] / g, 1.0, coeffs[2] / g]
    }
}
