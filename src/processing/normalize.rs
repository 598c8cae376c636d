use std::io::Cursor;

use fast_image_resize as fir;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};
use jpeg_decoder::{Decoder as JpegDecoder, PixelFormat};
use tracing::debug;

use super::NormalizeError;
use super::orientation::{apply_orientation, read_orientation};
use super::raw;
use crate::media::extension_of;

pub const DEFAULT_QUALITY: f32 = 0.9;

/// Output of the CPU-heavy half of normalization.
pub(crate) enum Decoded {
    /// The input is already a small upright JPEG.
    PassThrough,
    /// Opaque, upright, at most `max_dimension` on its largest side.
    Image(RgbaImage),
}

/// Converts `bytes` into an opaque JPEG no larger than `max_dimension` on its largest side.
pub fn normalize(
    bytes: &[u8],
    max_dimension: u32,
    filename_hint: Option<&str>,
    quality: f32,
) -> Result<Vec<u8>, NormalizeError> {
    match decode(bytes, max_dimension, filename_hint)? {
        Decoded::PassThrough => Ok(bytes.to_vec()),
        Decoded::Image(img) => encode_jpeg(&img, quality),
    }
}

#[derive(Debug, Clone, Copy)]
enum Attempt {
    EmbeddedPreview { oriented: bool },
    ScaledDecode { oriented: bool },
    FullDecode,
}

const ATTEMPTS: [Attempt; 5] = [
    Attempt::EmbeddedPreview { oriented: true },
    Attempt::EmbeddedPreview { oriented: false },
    Attempt::ScaledDecode { oriented: true },
    Attempt::ScaledDecode { oriented: false },
    Attempt::FullDecode,
];

pub(crate) fn decode(
    bytes: &[u8],
    max_dimension: u32,
    filename_hint: Option<&str>,
) -> Result<Decoded, NormalizeError> {
    let max_dimension = max_dimension.max(1);

    if let Some(ext) = filename_hint.and_then(extension_of) {
        if raw::is_raw_extension(&ext) {
            return raw::decode_raw(bytes, max_dimension, &ext).map(Decoded::Image);
        }
    }

    let format = image::guess_format(bytes)
        .map_err(|err| NormalizeError::Decode(format!("unrecognized image data: {err}")))?;

    if format == ImageFormat::Jpeg && is_small_upright_jpeg(bytes, max_dimension) {
        debug!(max_dimension, "normalize: jpeg pass-through");
        return Ok(Decoded::PassThrough);
    }

    let mut last_error = None;
    for attempt in ATTEMPTS {
        match run_attempt(attempt, bytes, format, max_dimension) {
            Ok(img) => {
                debug!(?attempt, width = img.width(), height = img.height(), "normalize: decoded");
                return Ok(Decoded::Image(img));
            }
            Err(err) => {
                debug!(?attempt, error = %err, "normalize: attempt failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| NormalizeError::Decode("no decode path succeeded".into())))
}

fn is_small_upright_jpeg(bytes: &[u8], max_dimension: u32) -> bool {
    let dims = ImageReader::with_format(Cursor::new(bytes), ImageFormat::Jpeg).into_dimensions();
    match dims {
        Ok((w, h)) => {
            w.max(h) <= max_dimension && read_orientation(bytes, ImageFormat::Jpeg) == Ok(1)
        }
        Err(_) => false,
    }
}

fn run_attempt(
    attempt: Attempt,
    bytes: &[u8],
    format: ImageFormat,
    max_dimension: u32,
) -> Result<RgbaImage, NormalizeError> {
    match attempt {
        Attempt::EmbeddedPreview { oriented } => {
            let orientation = orientation_for(oriented, bytes, format)?;
            let preview = embedded_preview(bytes, format)?;
            if preview.width().max(preview.height()) < max_dimension {
                return Err(NormalizeError::Decode(format!(
                    "embedded preview {}x{} is smaller than {max_dimension}",
                    preview.width(),
                    preview.height()
                )));
            }
            finish(flatten_alpha(preview), orientation, max_dimension)
        }
        Attempt::ScaledDecode { oriented } => {
            let orientation = orientation_for(oriented, bytes, format)?;
            let img = if format == ImageFormat::Jpeg {
                decode_jpeg_scaled(bytes, max_dimension)?
            } else {
                let decoded = image::load_from_memory_with_format(bytes, format)
                    .map_err(|err| NormalizeError::Decode(err.to_string()))?;
                flatten_alpha(decoded)
            };
            finish(img, orientation, max_dimension)
        }
        Attempt::FullDecode => {
            let mut reader = ImageReader::new(Cursor::new(bytes))
                .with_guessed_format()
                .map_err(|err| NormalizeError::Decode(err.to_string()))?;
            reader.no_limits();
            let decoded = reader
                .decode()
                .map_err(|err| NormalizeError::Decode(err.to_string()))?;
            let img = apply_orientation(flatten_alpha(decoded), orientation_or_upright(bytes, format));
            let (w, h) = fit_within_size(img.width(), img.height(), max_dimension);
            if (w, h) == img.dimensions() {
                return Ok(img);
            }
            Ok(image::imageops::resize(
                &img,
                w,
                h,
                image::imageops::FilterType::Triangle,
            ))
        }
    }
}

fn orientation_for(oriented: bool, bytes: &[u8], format: ImageFormat) -> Result<u16, NormalizeError> {
    if oriented {
        read_orientation(bytes, format).map_err(NormalizeError::Decode)
    } else {
        Ok(1)
    }
}

fn orientation_or_upright(bytes: &[u8], format: ImageFormat) -> u16 {
    read_orientation(bytes, format).unwrap_or(1)
}

fn finish(img: RgbaImage, orientation: u16, max_dimension: u32) -> Result<RgbaImage, NormalizeError> {
    let (w, h) = fit_within_size(img.width(), img.height(), max_dimension);
    let resized = resize_rgba(&img, w, h)?;
    Ok(apply_orientation(resized, orientation))
}

/// Largest size with the same aspect ratio whose longer side is at most `max_dimension`.
pub fn fit_within_size(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_dimension || longest == 0 {
        return (width.max(1), height.max(1));
    }
    let scale = |side: u32| -> u32 {
        let scaled = (u64::from(side) * u64::from(max_dimension) + u64::from(longest) / 2)
            / u64::from(longest);
        (scaled as u32).clamp(1, max_dimension)
    };
    (scale(width), scale(height))
}

/// EXIF thumbnail (IFD1) decoded as RGBA.
fn embedded_preview(bytes: &[u8], format: ImageFormat) -> Result<DynamicImage, NormalizeError> {
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Tiff) {
        return Err(NormalizeError::Decode("no embedded preview".into()));
    }
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .map_err(|err| NormalizeError::Decode(format!("no embedded preview: {err}")))?;
    let field_uint = |tag| {
        exif.get_field(tag, exif::In::THUMBNAIL)
            .and_then(|field| field.value.get_uint(0))
            .map(|v| v as usize)
    };
    let (Some(offset), Some(len)) = (
        field_uint(exif::Tag::JPEGInterchangeFormat),
        field_uint(exif::Tag::JPEGInterchangeFormatLength),
    ) else {
        return Err(NormalizeError::Decode("no embedded preview".into()));
    };
    let thumb = exif
        .buf()
        .get(offset..offset.saturating_add(len))
        .ok_or_else(|| NormalizeError::Decode("embedded preview out of bounds".into()))?;
    image::load_from_memory_with_format(thumb, ImageFormat::Jpeg)
        .map_err(|err| NormalizeError::Decode(format!("embedded preview: {err}")))
}

/// DCT-domain downscaled JPEG decode; never smaller than the fitted target.
fn decode_jpeg_scaled(bytes: &[u8], max_dimension: u32) -> Result<RgbaImage, NormalizeError> {
    let jpeg_err = |err: jpeg_decoder::Error| match err {
        jpeg_decoder::Error::Unsupported(feature) => {
            NormalizeError::Decode(format!("unsupported JPEG feature: {feature:?}"))
        }
        other => NormalizeError::Decode(other.to_string()),
    };

    let mut decoder = JpegDecoder::new(Cursor::new(bytes));
    decoder.read_info().map_err(jpeg_err)?;
    let info = decoder
        .info()
        .ok_or_else(|| NormalizeError::Decode("missing JPEG header".into()))?;
    let (target_w, target_h) =
        fit_within_size(u32::from(info.width), u32::from(info.height), max_dimension);
    let request_w = target_w.clamp(1, u16::MAX as u32) as u16;
    let request_h = target_h.clamp(1, u16::MAX as u32) as u16;
    decoder.scale(request_w, request_h).map_err(jpeg_err)?;
    let pixels = decoder.decode().map_err(jpeg_err)?;
    let info = decoder
        .info()
        .ok_or_else(|| NormalizeError::Decode("missing JPEG header".into()))?;
    let width = u32::from(info.width);
    let height = u32::from(info.height);

    let rgba = match info.pixel_format {
        PixelFormat::RGB24 => {
            let mut rgba = Vec::with_capacity(pixels.len() / 3 * 4);
            for chunk in pixels.chunks_exact(3) {
                rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
            rgba
        }
        PixelFormat::L8 => {
            let mut rgba = Vec::with_capacity(pixels.len() * 4);
            for &v in &pixels {
                rgba.extend_from_slice(&[v, v, v, 255]);
            }
            rgba
        }
        PixelFormat::CMYK32 => {
            let mut rgba = Vec::with_capacity(pixels.len());
            for chunk in pixels.chunks_exact(4) {
                let k = f32::from(chunk[3]) / 255.0;
                let channel = |c: u8| {
                    let c = f32::from(c) / 255.0 * (1.0 - k) + k;
                    ((1.0 - c) * 255.0).round().clamp(0.0, 255.0) as u8
                };
                rgba.extend_from_slice(&[channel(chunk[0]), channel(chunk[1]), channel(chunk[2]), 255]);
            }
            rgba
        }
        PixelFormat::L16 => {
            return Err(NormalizeError::Decode(
                "16-bit grayscale JPEGs are not supported by the scaled decoder".into(),
            ));
        }
    };

    RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| NormalizeError::Decode("decoded JPEG buffer has the wrong size".into()))
}

/// Composites onto opaque black; images without alpha pass through unchanged.
pub(crate) fn flatten_alpha(img: DynamicImage) -> RgbaImage {
    let has_alpha = img.color().has_alpha();
    let mut rgba = img.into_rgba8();
    if has_alpha {
        for px in rgba.pixels_mut() {
            let a = u16::from(px[3]);
            for c in 0..3 {
                px[c] = ((u16::from(px[c]) * a + 127) / 255) as u8;
            }
            px[3] = 255;
        }
    }
    rgba
}

pub(crate) fn resize_rgba(
    source: &RgbaImage,
    target_w: u32,
    target_h: u32,
) -> Result<RgbaImage, NormalizeError> {
    if target_w == 0 || target_h == 0 {
        return Err(NormalizeError::Resize("dimensions must be positive".into()));
    }
    if source.width() == target_w && source.height() == target_h {
        return Ok(source.clone());
    }

    let src_view = fir::images::ImageRef::new(
        source.width(),
        source.height(),
        source.as_raw(),
        fir::PixelType::U8x4,
    )
    .map_err(|err| NormalizeError::Resize(err.to_string()))?;
    let mut dst_image = fir::images::Image::new(target_w, target_h, fir::PixelType::U8x4);
    let options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom));
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_view, &mut dst_image, Some(&options))
        .map_err(|err| NormalizeError::Resize(err.to_string()))?;
    RgbaImage::from_raw(target_w, target_h, dst_image.into_vec())
        .ok_or_else(|| NormalizeError::Resize("resized buffer has the wrong size".into()))
}

/// `quality` is clamped to 0.0..=1.0 and mapped onto JPEG quality 1..=100.
pub(crate) fn encode_jpeg(img: &RgbaImage, quality: f32) -> Result<Vec<u8>, NormalizeError> {
    let quality = if quality.is_finite() { quality } else { DEFAULT_QUALITY };
    let q = ((quality.clamp(0.0, 1.0) * 100.0).round() as u8).clamp(1, 100);
    let rgb = DynamicImage::ImageRgba8(img.clone()).into_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, q)
        .encode_image(&rgb)
        .map_err(|err| NormalizeError::Encode(err.to_string()))?;
    if out.is_empty() {
        return Err(NormalizeError::Encode("encoder produced no data".into()));
    }
    Ok(out)
}
