use crate::config::Config;
use crate::crop::Cropper;
use crate::error::{ImageError, NotFoundKind, TransformKind};
use crate::naming::{DerivativeRequest, ImageExt};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// A ready-to-serve derivative: either a materialized file or, when the
/// cache-write path is broken, transient bytes generated in memory.
#[derive(Debug)]
pub enum Served {
    File { path: PathBuf, ext: ImageExt },
    Bytes { bytes: Vec<u8>, ext: ImageExt },
}

impl Served {
    pub fn ext(&self) -> ImageExt {
        match self {
            Served::File { ext, .. } | Served::Bytes { ext, .. } => *ext,
        }
    }
}

/// Maps a requested derivative path to a cache hit or drives generation on
/// a miss. Requests are relative to the upload root.
pub struct Resolver {
    base_path: PathBuf,
    image_sizes: HashSet<String>,
    enable_all_sizes: bool,
    cropper: Cropper,
}

impl Resolver {
    pub fn new(config: &Config) -> Self {
        Resolver {
            base_path: config.upload_base(),
            image_sizes: config.image_sizes.clone(),
            enable_all_sizes: config.enable_all_sizes,
            cropper: Cropper::default(),
        }
    }

    /// Serve one derivative request. Blocking; run off the async pool.
    pub fn serve(&self, raw_path: &str) -> Result<Served, ImageError> {
        let req = DerivativeRequest::parse(raw_path)?;

        // Only plain name segments may reach the filesystem. Anything else
        // (absolute roots, `..`, drive prefixes) would let `join` step
        // outside the base dir.
        if Path::new(&req.base_name)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ImageError::NotFound(NotFoundKind::PathTraversal));
        }

        let actual = self.base_path.join(req.key());
        if actual.is_file() {
            return Ok(Served::File { path: actual, ext: req.ext });
        }

        if !self.enable_all_sizes && !self.image_sizes.contains(&req.size_label()) {
            return Err(ImageError::NotFound(NotFoundKind::SizeNotAllowed));
        }

        let original = self.base_path.join(req.original_name());
        if !original.is_file() {
            return Err(ImageError::NotFound(NotFoundKind::OriginalMissing));
        }

        let img = image::open(&original)
            .map_err(|e| ImageError::Transform(TransformKind::EngineFault(e.to_string())))?;
        let out = self.cropper.crop(&img, req.width, req.height, req.crop_mode);
        let bytes = self.cropper.encode(&out, req.ext)?;

        // Materialize for the next request; if the write path is broken the
        // caller still gets a usable image from memory.
        if let Some(parent) = actual.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("cannot create derivative dir {}: {}", parent.display(), e);
                return Ok(Served::Bytes { bytes, ext: req.ext });
            }
        }
        match std::fs::write(&actual, &bytes) {
            Ok(()) => Ok(Served::File { path: actual, ext: req.ext }),
            Err(e) => {
                tracing::warn!("cannot materialize derivative {}: {}", actual.display(), e);
                Ok(Served::Bytes { bytes, ext: req.ext })
            }
        }
    }
}
