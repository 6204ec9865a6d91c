use crate::crop::{self, CropMode, Cropper, DERIVATIVE_JPEG_QUALITY};
use crate::dedup::DedupIndex;
use crate::error::{ImageError, TransformKind, ValidationKind};
use crate::naming::ImageExt;
use crate::optimizer::{Optimizer, OPTIMIZE_JPEG_QUALITY};
use crate::storage::{SaveOptions, StorageRegistry, UploadedImage};
use image::Rgba;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

static ROTATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("rotate"));
static CLIP_RECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+),(\d+),(\d+),(\d+)$").expect("clipRect"));
static THUMB_SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)x(\d+)$").expect("thumbSize"));
static QUALITY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("quality"));
static DIR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9/_-]+$").expect("dir"));

/// Rectangular clip region, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

/// Request-level upload controls. Every field has its own syntax check;
/// anything malformed rejects the whole request before a file is touched.
#[derive(Debug, Clone)]
pub struct UploadParams {
    pub multi: bool,
    pub dir: String,
    pub rotate: Option<f64>,
    pub rotate_background: Rgba<u8>,
    pub clip_rect: Option<ClipRect>,
    pub thumb_size: Option<(u32, u32)>,
    pub optimize: bool,
    pub quality: u8,
    pub storage: Option<String>,
}

impl Default for UploadParams {
    fn default() -> Self {
        UploadParams {
            multi: false,
            dir: String::new(),
            rotate: None,
            rotate_background: Rgba([0, 0, 0, 0]),
            clip_rect: None,
            thumb_size: None,
            optimize: false,
            quality: OPTIMIZE_JPEG_QUALITY,
            storage: None,
        }
    }
}

impl UploadParams {
    /// Parse request fields; unknown fields are ignored, empty values are as
    /// good as absent.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, ImageError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut params = UploadParams::default();
        let bad = |what: &str, value: &str| {
            ImageError::Validation(ValidationKind::BadParameterSyntax(format!(
                "{what}: {value}"
            )))
        };

        for (name, value) in fields {
            if value.is_empty() {
                continue;
            }
            match name {
                "multi" => params.multi = parse_flag(value),
                "optimize" => params.optimize = parse_flag(value),
                "rotate" => {
                    if !ROTATE_RE.is_match(value) {
                        return Err(bad("rotate", value));
                    }
                    params.rotate = Some(value.parse().map_err(|_| bad("rotate", value))?);
                }
                "rotateBackground" => {
                    params.rotate_background = crop::parse_color(value)?;
                }
                "clipRect" => {
                    let caps = CLIP_RECT_RE.captures(value).ok_or_else(|| bad("clipRect", value))?;
                    let n = |i: usize| -> Result<u32, ImageError> {
                        caps[i].parse().map_err(|_| bad("clipRect", value))
                    };
                    params.clip_rect = Some(ClipRect {
                        left: n(1)?,
                        top: n(2)?,
                        width: n(3)?,
                        height: n(4)?,
                    });
                }
                "thumbSize" => {
                    let caps =
                        THUMB_SIZE_RE.captures(value).ok_or_else(|| bad("thumbSize", value))?;
                    let w = caps[1].parse().map_err(|_| bad("thumbSize", value))?;
                    let h = caps[2].parse().map_err(|_| bad("thumbSize", value))?;
                    params.thumb_size = Some((w, h));
                }
                "quality" => {
                    if !QUALITY_RE.is_match(value) {
                        return Err(bad("quality", value));
                    }
                    params.quality = value.parse().map_err(|_| bad("quality", value))?;
                }
                "dir" => {
                    if !DIR_RE.is_match(value) {
                        return Err(ImageError::Validation(ValidationKind::IllegalDirectory));
                    }
                    params.dir = value.to_string();
                }
                "storage" => params.storage = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(params)
    }

    /// Any step that needs the pixel engine.
    pub fn has_pixel_edits(&self) -> bool {
        self.rotate.is_some() || self.clip_rect.is_some() || self.thumb_size.is_some()
    }

    /// Any step that rewrites the uploaded bytes.
    pub fn has_edits(&self) -> bool {
        self.has_pixel_edits() || self.optimize
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.to_lowercase().as_str(),
        "" | "false" | "no" | "0"
    )
}

/// An upload as delivered by the transport, before validation.
#[derive(Debug, Clone)]
pub struct RawUpload {
    pub original_name: String,
    pub bytes: Vec<u8>,
}

/// One successfully stored upload, as reported back to the caller. Never
/// carries server-absolute paths.
#[derive(Debug, Clone, Serialize)]
pub struct UploadItem {
    #[serde(rename = "originalName")]
    pub original_name: String,
    #[serde(rename = "fileSize")]
    pub file_size: usize,
    #[serde(rename = "extName")]
    pub ext_name: String,
    pub path: String,
    pub url: String,
}

/// Drives an upload end to end: validation, optional pre-save edits, the
/// dedup shortcut, backend save and index upkeep.
pub struct Uploader {
    registry: Arc<StorageRegistry>,
    index: Arc<DedupIndex>,
    max_upload_size: usize,
}

impl Uploader {
    pub fn new(registry: Arc<StorageRegistry>, index: Arc<DedupIndex>, max_upload_size: usize) -> Self {
        Uploader {
            registry,
            index,
            max_upload_size,
        }
    }

    /// Store every file in the batch. The first failing file aborts the
    /// whole request; files already saved stay saved (uploads are not
    /// transactional).
    pub async fn save_all(
        &self,
        files: Vec<RawUpload>,
        params: &UploadParams,
    ) -> Result<Vec<UploadItem>, ImageError> {
        if files.is_empty() {
            return Err(ImageError::Validation(ValidationKind::TransportFault));
        }

        let backend = self.registry.select(params.storage.as_deref())?;
        let mut items = Vec::with_capacity(files.len());

        for raw in files {
            let ext = self.validate(&raw)?;
            let original_name = raw.original_name;
            let mut bytes = raw.bytes;

            if ext == ImageExt::Gif && params.has_pixel_edits() {
                return Err(ImageError::Transform(TransformKind::UnsupportedFormat(
                    "gif images cannot be rotated or clipped".to_string(),
                )));
            }

            // Dedup shortcut: local backend, untouched bytes only.
            if backend.scheme() == "file" && !params.has_edits() {
                let index = self.index.clone();
                let (returned, hit) = tokio::task::spawn_blocking(move || {
                    let mut rng = rand::thread_rng();
                    let hit = index.find_equivalent(&bytes, &mut rng);
                    (bytes, hit)
                })
                .await
                .map_err(join_fault)?;
                bytes = returned;

                match hit {
                    Ok(Some(rel)) => {
                        let path = format!("file://{rel}");
                        let url =
                            backend.resolve_url(&path, 0, 0, CropMode::default(), "http");
                        tracing::debug!("dedup hit for {}: reusing {}", original_name, rel);
                        items.push(UploadItem {
                            original_name,
                            file_size: bytes.len(),
                            ext_name: ext.as_str().to_string(),
                            path,
                            url,
                        });
                        continue;
                    }
                    Ok(None) => {}
                    // The shortcut is an optimization; index trouble must
                    // not fail the upload.
                    Err(e) => tracing::warn!("dedup lookup failed: {}", e),
                }
            }

            if params.has_pixel_edits() && ext != ImageExt::Gif {
                let edit_params = params.clone();
                bytes = tokio::task::spawn_blocking(move || apply_edits(bytes, ext, &edit_params))
                    .await
                    .map_err(join_fault)??;
            }

            let file = UploadedImage {
                original_name: original_name.clone(),
                ext,
                bytes,
            };
            let stored = backend
                .save(
                    &file,
                    &SaveOptions {
                        dir: params.dir.clone(),
                        protocol: "http".to_string(),
                    },
                )
                .await?;

            if let Some(full_path) = stored.full_path {
                // Plain optimize requests recompress the stored file in
                // place; pixel edits already recompressed before the save.
                let optimize_in_place = params.optimize && !params.has_pixel_edits();
                let index = self.index.clone();
                let record = tokio::task::spawn_blocking(move || {
                    if optimize_in_place {
                        if let Some(saved) = Optimizer::default().optimize(&full_path) {
                            tracing::debug!("optimized {}: {} bytes saved", full_path.display(), saved);
                        }
                    }
                    index.record_asset(&full_path)
                })
                .await
                .map_err(join_fault)?;
                if let Err(e) = record {
                    // Index upkeep is additive and reconciled by rebuild.
                    tracing::warn!("could not record uploaded asset: {}", e);
                }
            }

            items.push(UploadItem {
                original_name,
                file_size: file.bytes.len(),
                ext_name: ext.as_str().to_string(),
                path: stored.path,
                url: stored.url,
            });
        }

        Ok(items)
    }

    fn validate(&self, raw: &RawUpload) -> Result<ImageExt, ImageError> {
        if raw.original_name.is_empty() || raw.bytes.is_empty() {
            return Err(ImageError::Validation(ValidationKind::TransportFault));
        }
        let ext = ImageExt::of_file_name(&raw.original_name).ok_or_else(|| {
            ImageError::Validation(ValidationKind::BadExtension(
                "png, jpg, jpeg, gif".to_string(),
            ))
        })?;
        if raw.bytes.len() > self.max_upload_size {
            return Err(ImageError::Validation(ValidationKind::TooLarge));
        }
        Ok(ext)
    }
}

fn join_fault(e: tokio::task::JoinError) -> ImageError {
    ImageError::Transform(TransformKind::EngineFault(e.to_string()))
}

/// Pre-save edit pipeline: rotate, clip, thumbnail crop, recompress.
fn apply_edits(bytes: Vec<u8>, ext: ImageExt, params: &UploadParams) -> Result<Vec<u8>, ImageError> {
    let cropper = Cropper::default();
    let mut img = crop::decode(&bytes)?;

    if let Some(degrees) = params.rotate {
        img = cropper.rotate(&img, degrees, params.rotate_background);
    }
    if let Some(rect) = params.clip_rect {
        img = cropper.clip(&img, rect.left, rect.top, rect.width, rect.height)?;
    }
    if let Some((w, h)) = params.thumb_size {
        img = cropper.crop(&img, w, h, CropMode::CenterCropScale);
    }

    let quality = if params.optimize {
        params.quality
    } else {
        DERIVATIVE_JPEG_QUALITY
    };
    crop::encode_with_quality(&img, ext, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StorageScheme};
    use crate::dedup::MemoryIndexStore;
    use image::{DynamicImage, RgbaImage};
    use std::collections::HashSet;
    use std::path::Path;

    fn fields(pairs: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        pairs.to_vec()
    }

    #[test]
    fn params_parse_the_full_surface() {
        let params = UploadParams::from_fields(fields(&[
            ("multi", "true"),
            ("dir", "avatars/2024"),
            ("rotate", "-90.5"),
            ("rotateBackground", "#ff0000"),
            ("clipRect", "1,2,30,40"),
            ("thumbSize", "320x200"),
            ("optimize", "yes"),
            ("quality", "60"),
            ("storage", "cdn"),
        ]))
        .unwrap();

        assert!(params.multi);
        assert_eq!(params.dir, "avatars/2024");
        assert_eq!(params.rotate, Some(-90.5));
        assert_eq!(params.rotate_background, Rgba([255, 0, 0, 255]));
        assert_eq!(
            params.clip_rect,
            Some(ClipRect { left: 1, top: 2, width: 30, height: 40 })
        );
        assert_eq!(params.thumb_size, Some((320, 200)));
        assert!(params.optimize);
        assert_eq!(params.quality, 60);
        assert_eq!(params.storage.as_deref(), Some("cdn"));
        assert!(params.has_edits() && params.has_pixel_edits());
    }

    #[test]
    fn falsy_flags_are_recognized() {
        for v in ["false", "no", "0", "FALSE"] {
            let params = UploadParams::from_fields(fields(&[("multi", v)])).unwrap();
            assert!(!params.multi, "{v} should be falsy");
        }
        let params = UploadParams::from_fields(fields(&[("multi", "1")])).unwrap();
        assert!(params.multi);
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        for (name, value) in [
            ("rotate", "ninety"),
            ("rotateBackground", "red"),
            ("rotateBackground", "#12"),
            ("clipRect", "1,2,3"),
            ("clipRect", "-1,2,3,4"),
            ("thumbSize", "320by200"),
            ("quality", "high"),
        ] {
            let err = UploadParams::from_fields(fields(&[(name, value)])).unwrap_err();
            assert_eq!(err.status(), 400, "{name}={value}");
        }
    }

    #[test]
    fn illegal_directories_are_rejected() {
        let err = UploadParams::from_fields(fields(&[("dir", "../secret")])).unwrap_err();
        assert!(matches!(
            err,
            ImageError::Validation(ValidationKind::IllegalDirectory)
        ));
        assert!(UploadParams::from_fields(fields(&[("dir", "a/B_c-9")])).is_ok());
    }

    fn test_config(dir: &Path) -> Config {
        std::fs::create_dir_all(dir.join("uploads")).unwrap();
        Config {
            img_host: "img.example.com".to_string(),
            img_host_aliases: vec![],
            enable_all_sizes: true,
            image_sizes: HashSet::new(),
            max_upload_size: 1 << 21,
            site_base_dir: dir.to_path_buf(),
            upload_dir: "uploads".to_string(),
            default_storage: StorageScheme::File,
            enabled_storage: vec![StorageScheme::File],
            allow_storage_override: false,
            index_path: dir.join("index.json"),
            cdn_access_key: None,
            cdn_secret_key: None,
            cdn_bucket: None,
            cdn_access_domain: None,
            cdn_upload_url: None,
            server_port: 0,
        }
    }

    fn uploader(dir: &Path) -> Uploader {
        let config = test_config(dir);
        let registry = Arc::new(StorageRegistry::from_config(&config).unwrap());
        let index = Arc::new(DedupIndex::new(
            Box::new(MemoryIndexStore::new()),
            dir.to_path_buf(),
        ));
        Uploader::new(registry, index, config.max_upload_size)
    }

    fn png_bytes(w: u32, h: u32, seed: u8) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            w,
            h,
            image::Rgba([seed, seed.wrapping_add(10), seed.wrapping_add(20), 255]),
        ));
        crop::encode_with_quality(&img, ImageExt::Png, 80).unwrap()
    }

    #[tokio::test]
    async fn plain_upload_lands_on_the_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(dir.path());
        let items = uploader
            .save_all(
                vec![RawUpload { original_name: "a.png".into(), bytes: png_bytes(16, 16, 1) }],
                &UploadParams::default(),
            )
            .await
            .unwrap();

        assert_eq!(items.len(), 1);
        assert!(items[0].path.starts_with("file:///uploads/"));
        assert!(!items[0].path.contains(&dir.path().display().to_string()));
        assert!(!items[0].url.contains(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn identical_second_upload_reuses_the_first_location() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(dir.path());
        let data = png_bytes(64, 64, 5);

        let first = uploader
            .save_all(
                vec![RawUpload { original_name: "a.jpg".into(), bytes: data.clone() }],
                &UploadParams::default(),
            )
            .await
            .unwrap();
        let second = uploader
            .save_all(
                vec![RawUpload { original_name: "b.jpg".into(), bytes: data }],
                &UploadParams::default(),
            )
            .await
            .unwrap();

        assert_eq!(first[0].path, second[0].path);
        assert_eq!(second[0].original_name, "b.jpg");
    }

    #[tokio::test]
    async fn edited_uploads_skip_the_dedup_shortcut() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(dir.path());
        let data = png_bytes(64, 64, 5);
        let edit = UploadParams {
            thumb_size: Some((16, 16)),
            ..UploadParams::default()
        };

        let first = uploader
            .save_all(
                vec![RawUpload { original_name: "a.png".into(), bytes: data.clone() }],
                &UploadParams::default(),
            )
            .await
            .unwrap();
        let second = uploader
            .save_all(vec![RawUpload { original_name: "b.png".into(), bytes: data }], &edit)
            .await
            .unwrap();

        assert_ne!(first[0].path, second[0].path);
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let registry = Arc::new(StorageRegistry::from_config(&config).unwrap());
        let index = Arc::new(DedupIndex::new(
            Box::new(MemoryIndexStore::new()),
            dir.path().to_path_buf(),
        ));
        let uploader = Uploader::new(registry, index, 100);

        let err = uploader
            .save_all(
                vec![RawUpload { original_name: "a.png".into(), bytes: vec![0u8; 101] }],
                &UploadParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Validation(ValidationKind::TooLarge)));
    }

    #[tokio::test]
    async fn unknown_extensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = uploader(dir.path())
            .save_all(
                vec![RawUpload { original_name: "a.webp".into(), bytes: vec![1, 2, 3] }],
                &UploadParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::Validation(ValidationKind::BadExtension(_))
        ));
    }

    #[tokio::test]
    async fn gif_rejects_pixel_edits_but_allows_plain_storage() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(dir.path());
        let gif = {
            let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                8,
                8,
                image::Rgba([1, 2, 3, 255]),
            ));
            crop::encode_with_quality(&img, ImageExt::Gif, 80).unwrap()
        };

        let rotate = UploadParams { rotate: Some(90.0), ..UploadParams::default() };
        let err = uploader
            .save_all(
                vec![RawUpload { original_name: "a.gif".into(), bytes: gif.clone() }],
                &rotate,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::Transform(TransformKind::UnsupportedFormat(_))
        ));

        let ok = uploader
            .save_all(
                vec![RawUpload { original_name: "a.gif".into(), bytes: gif }],
                &UploadParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(ok[0].ext_name, "gif");
    }

    #[tokio::test]
    async fn thumbnail_edit_produces_target_sized_output() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(dir.path());
        let params = UploadParams {
            thumb_size: Some((20, 10)),
            ..UploadParams::default()
        };
        let items = uploader
            .save_all(
                vec![RawUpload { original_name: "a.png".into(), bytes: png_bytes(100, 100, 9) }],
                &params,
            )
            .await
            .unwrap();

        let rel = items[0].path.strip_prefix("file://").unwrap();
        let stored = dir.path().join(rel.trim_start_matches('/'));
        let img = image::open(stored).unwrap();
        assert_eq!((img.width(), img.height()), (20, 10));
    }

    #[tokio::test]
    async fn optimize_only_leaves_small_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = uploader(dir.path());
        let data = png_bytes(16, 16, 3);
        let params = UploadParams { optimize: true, ..UploadParams::default() };
        let items = uploader
            .save_all(
                vec![RawUpload { original_name: "a.png".into(), bytes: data.clone() }],
                &params,
            )
            .await
            .unwrap();

        // Non-jpeg and under the size floor: the in-place pass is a no-op.
        let rel = items[0].path.strip_prefix("file://").unwrap();
        let stored = dir.path().join(rel.trim_start_matches('/'));
        assert_eq!(std::fs::read(stored).unwrap(), data);
    }

    #[tokio::test]
    async fn empty_batches_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = uploader(dir.path())
            .save_all(vec![], &UploadParams::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::Validation(ValidationKind::TransportFault)
        ));
    }
}
