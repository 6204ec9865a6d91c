use crate::error::{ImageError, TransformKind, ValidationKind};
use crate::naming::ImageExt;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{imageops, DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

/// JPEG quality for generated derivatives. Independent of the standalone
/// optimizer's quality setting; the two are tuned separately.
pub const DERIVATIVE_JPEG_QUALITY: u8 = 80;

/// How source and target aspect ratios are reconciled when generating a
/// derivative. Closed set; the numeric value is part of the URL grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CropMode {
    /// Scale to fully cover the target box, then crop the excess from the center.
    #[default]
    CenterCropScale = 0,
    /// Scale to fit within the target box, preserving aspect ratio.
    FitScale = 1,
    /// FitScale, then pad to exactly the target dimensions.
    FitScaleWithPad = 2,
    /// Scale each axis independently to the target, ignoring aspect ratio.
    StretchScale = 3,
    /// Crop a target-sized window from the top-left corner, no scaling.
    /// Undersized sources get the missing region filled with the background.
    TopLeftCrop = 4,
}

impl TryFrom<u32> for CropMode {
    type Error = ImageError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CropMode::CenterCropScale),
            1 => Ok(CropMode::FitScale),
            2 => Ok(CropMode::FitScaleWithPad),
            3 => Ok(CropMode::StretchScale),
            4 => Ok(CropMode::TopLeftCrop),
            other => Err(ImageError::Config(
                crate::error::ConfigKind::InvalidCropMode(other),
            )),
        }
    }
}

/// Parse `#RGB`, `#RRGGBB` or `#RRGGBBAA` into a pixel.
pub fn parse_color(s: &str) -> Result<Rgba<u8>, ImageError> {
    let bad = || {
        ImageError::Validation(ValidationKind::BadParameterSyntax(format!(
            "invalid color: {s}"
        )))
    };
    let hex = s.strip_prefix('#').ok_or_else(bad)?;
    let nibble = |c: u8| -> Result<u8, ImageError> {
        (c as char).to_digit(16).map(|d| d as u8).ok_or_else(bad)
    };
    let byte = |pair: &[u8]| -> Result<u8, ImageError> {
        Ok(nibble(pair[0])? << 4 | nibble(pair[1])?)
    };
    let b = hex.as_bytes();
    match b.len() {
        3 => {
            let r = nibble(b[0])?;
            let g = nibble(b[1])?;
            let bl = nibble(b[2])?;
            Ok(Rgba([r << 4 | r, g << 4 | g, bl << 4 | bl, 0xff]))
        }
        6 => Ok(Rgba([byte(&b[0..2])?, byte(&b[2..4])?, byte(&b[4..6])?, 0xff])),
        8 => Ok(Rgba([
            byte(&b[0..2])?,
            byte(&b[2..4])?,
            byte(&b[4..6])?,
            byte(&b[6..8])?,
        ])),
        _ => Err(bad()),
    }
}

/// Transform dispatcher over the pixel engine. One instance per pipeline so
/// the derivative path and the upload edit path keep their own quality knobs.
#[derive(Debug, Clone)]
pub struct Cropper {
    pub quality: u8,
    pub background: Rgba<u8>,
}

impl Default for Cropper {
    fn default() -> Self {
        Cropper {
            quality: DERIVATIVE_JPEG_QUALITY,
            background: Rgba([0xff, 0xff, 0xff, 0xff]),
        }
    }
}

impl Cropper {
    /// Apply the crop-mode policy for the requested target box. A zero
    /// dimension is inferred from the source aspect ratio; both zero is a
    /// pass-through.
    pub fn crop(&self, img: &DynamicImage, width: u32, height: u32, mode: CropMode) -> DynamicImage {
        let (sw, sh) = img.dimensions();
        let (w, h) = resolve_target(sw, sh, width, height);
        if w == 0 || h == 0 {
            return img.clone();
        }

        match mode {
            CropMode::CenterCropScale => img.resize_to_fill(w, h, FilterType::Lanczos3),
            CropMode::FitScale => img.resize(w, h, FilterType::Lanczos3),
            CropMode::FitScaleWithPad => {
                let fitted = img.resize(w, h, FilterType::Lanczos3);
                let mut canvas = RgbaImage::from_pixel(w, h, self.background);
                let x = (w - fitted.width()) / 2;
                let y = (h - fitted.height()) / 2;
                imageops::overlay(&mut canvas, &fitted.to_rgba8(), x as i64, y as i64);
                DynamicImage::ImageRgba8(canvas)
            }
            CropMode::StretchScale => img.resize_exact(w, h, FilterType::Lanczos3),
            CropMode::TopLeftCrop => {
                let mut canvas = RgbaImage::from_pixel(w, h, self.background);
                imageops::overlay(&mut canvas, &img.to_rgba8(), 0, 0);
                DynamicImage::ImageRgba8(canvas)
            }
        }
    }

    /// Rotate by an arbitrary angle (degrees, clockwise) onto an enlarged
    /// canvas filled with `background`. Inverse-mapped nearest sampling.
    pub fn rotate(&self, img: &DynamicImage, degrees: f64, background: Rgba<u8>) -> DynamicImage {
        let (sw, sh) = img.dimensions();
        let rad = degrees.to_radians();
        let (sin, cos) = rad.sin_cos();
        let nw = (sw as f64 * cos.abs() + sh as f64 * sin.abs()).ceil() as u32;
        let nh = (sw as f64 * sin.abs() + sh as f64 * cos.abs()).ceil() as u32;

        let src = img.to_rgba8();
        let (cx, cy) = (sw as f64 / 2.0, sh as f64 / 2.0);
        let (ncx, ncy) = (nw as f64 / 2.0, nh as f64 / 2.0);

        let mut out = RgbaImage::from_pixel(nw.max(1), nh.max(1), background);
        for (x, y, px) in out.enumerate_pixels_mut() {
            let dx = x as f64 + 0.5 - ncx;
            let dy = y as f64 + 0.5 - ncy;
            // Rotate back into source space.
            let sx = dx * cos + dy * sin + cx;
            let sy = -dx * sin + dy * cos + cy;
            if sx >= 0.0 && sy >= 0.0 && (sx as u32) < sw && (sy as u32) < sh {
                *px = *src.get_pixel(sx as u32, sy as u32);
            }
        }
        DynamicImage::ImageRgba8(out)
    }

    /// Cut a rectangle out of the source. The rectangle must intersect the image.
    pub fn clip(
        &self,
        img: &DynamicImage,
        left: u32,
        top: u32,
        width: u32,
        height: u32,
    ) -> Result<DynamicImage, ImageError> {
        let (sw, sh) = img.dimensions();
        if left >= sw || top >= sh || width == 0 || height == 0 {
            return Err(ImageError::Transform(TransformKind::EngineFault(format!(
                "clip rectangle {left},{top},{width},{height} outside {sw}x{sh} image"
            ))));
        }
        let w = width.min(sw - left);
        let h = height.min(sh - top);
        Ok(img.crop_imm(left, top, w, h))
    }

    /// Encode to the target format. Re-encoding drops all non-pixel metadata;
    /// JPEG output is recompressed at this cropper's quality.
    pub fn encode(&self, img: &DynamicImage, ext: ImageExt) -> Result<Vec<u8>, ImageError> {
        encode_with_quality(img, ext, self.quality)
    }
}

/// Encode `img` as `ext`, using `quality` for lossy formats.
pub fn encode_with_quality(
    img: &DynamicImage,
    ext: ImageExt,
    quality: u8,
) -> Result<Vec<u8>, ImageError> {
    let mut buf = Cursor::new(Vec::new());
    let engine_fault =
        |e: image::ImageError| ImageError::Transform(TransformKind::EngineFault(e.to_string()));
    match ext {
        ImageExt::Jpg | ImageExt::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = img.to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            encoder.encode_image(&rgb).map_err(engine_fault)?;
        }
        ImageExt::Png => img.write_to(&mut buf, ImageFormat::Png).map_err(engine_fault)?,
        ImageExt::Gif => img.write_to(&mut buf, ImageFormat::Gif).map_err(engine_fault)?,
    }
    Ok(buf.into_inner())
}

/// Decode raw bytes into the pixel engine's working representation.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    image::load_from_memory(bytes)
        .map_err(|e| ImageError::Transform(TransformKind::EngineFault(e.to_string())))
}

fn resolve_target(sw: u32, sh: u32, width: u32, height: u32) -> (u32, u32) {
    if width == 0 && height == 0 {
        (0, 0)
    } else if width == 0 {
        ((sw as u64 * height as u64 / sh.max(1) as u64) as u32, height)
    } else if height == 0 {
        (width, (sh as u64 * width as u64 / sw.max(1) as u64) as u32)
    } else {
        (width, height)
    }
}
