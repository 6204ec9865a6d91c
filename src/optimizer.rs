use crate::crop::encode_with_quality;
use crate::naming::ImageExt;
use std::path::Path;

/// JPEG quality for the standalone post-upload optimizer. Deliberately its
/// own knob, separate from the derivative pipeline's quality.
pub const OPTIMIZE_JPEG_QUALITY: u8 = 75;

/// Files at or below this size are left alone.
pub const OPTIMIZE_MIN_FILE_SIZE: u64 = 100 * 1024;

/// In-place recompressor for stored JPEGs: strip metadata, re-encode at a
/// lower quality. Best effort; anything unexpected just skips the file.
#[derive(Debug, Clone)]
pub struct Optimizer {
    pub quality: u8,
    pub min_file_size: u64,
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer {
            quality: OPTIMIZE_JPEG_QUALITY,
            min_file_size: OPTIMIZE_MIN_FILE_SIZE,
        }
    }
}

impl Optimizer {
    /// Recompress `file` in place. Returns the byte delta (old - new) when
    /// the file was rewritten, `None` when it was skipped.
    pub fn optimize(&self, file: &Path) -> Option<i64> {
        let name = file.file_name()?.to_str()?;
        let ext = ImageExt::of_file_name(name)?;
        if !ext.is_jpeg() {
            return None;
        }

        let old_size = match std::fs::metadata(file) {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::debug!("optimizer cannot stat {}: {}", file.display(), e);
                return None;
            }
        };
        if old_size <= self.min_file_size {
            return None;
        }

        let img = match image::open(file) {
            Ok(img) => img,
            Err(e) => {
                tracing::debug!("optimizer cannot decode {}: {}", file.display(), e);
                return None;
            }
        };
        let bytes = match encode_with_quality(&img, ext, self.quality) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("optimizer cannot encode {}: {}", file.display(), e);
                return None;
            }
        };
        if let Err(e) = std::fs::write(file, &bytes) {
            tracing::debug!("optimizer cannot rewrite {}: {}", file.display(), e);
            return None;
        }
        Some(old_size as i64 - bytes.len() as i64)
    }
}
