use std::io::Cursor;

use image::{ImageFormat, RgbaImage, imageops};
use tracing::debug;

/// Containers kamadak-exif can parse.
fn carries_exif(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Tiff | ImageFormat::WebP
    )
}

/// EXIF orientation tag (1..=8). Missing metadata reads as 1; unreadable metadata is an error.
pub(crate) fn read_orientation(bytes: &[u8], format: ImageFormat) -> Result<u16, String> {
    if !carries_exif(format) {
        return Ok(1);
    }
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(1),
        Err(err) => return Err(format!("unreadable EXIF: {err}")),
    };
    let Some(field) = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY) else {
        return Ok(1);
    };
    match field.value.get_uint(0) {
        Some(value @ 1..=8) => {
            debug!(orientation = value, "exif orientation");
            Ok(value as u16)
        }
        other => Err(format!("unsupported EXIF orientation {other:?}")),
    }
}

/// Rotates and flips so the image displays upright.
pub(crate) fn apply_orientation(img: RgbaImage, orientation: u16) -> RgbaImage {
    match orientation {
        2 => imageops::flip_horizontal(&img),
        3 => imageops::rotate180(&img),
        4 => imageops::flip_vertical(&img),
        // transpose
        5 => imageops::flip_horizontal(&imageops::rotate90(&img)),
        6 => imageops::rotate90(&img),
        // transverse
        7 => imageops::flip_horizontal(&imageops::rotate270(&img)),
        8 => imageops::rotate270(&img),
        _ => img,
    }
}
