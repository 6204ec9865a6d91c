use crate::crop::CropMode;
use crate::error::{ImageError, NotFoundKind, ValidationKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

/// Image extensions the derivative pipeline serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageExt {
    Png,
    Jpg,
    Jpeg,
    Gif,
}

impl ImageExt {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageExt::Png => "png",
            ImageExt::Jpg => "jpg",
            ImageExt::Jpeg => "jpeg",
            ImageExt::Gif => "gif",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageExt::Png => "image/png",
            ImageExt::Jpg | ImageExt::Jpeg => "image/jpeg",
            ImageExt::Gif => "image/gif",
        }
    }

    pub fn is_jpeg(&self) -> bool {
        matches!(self, ImageExt::Jpg | ImageExt::Jpeg)
    }

    /// Extension of a file name, if it is one we serve.
    pub fn of_file_name(name: &str) -> Option<ImageExt> {
        let (_, ext) = name.rsplit_once('.')?;
        ext.parse().ok()
    }
}

impl FromStr for ImageExt {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageExt::Png),
            "jpg" => Ok(ImageExt::Jpg),
            "jpeg" => Ok(ImageExt::Jpeg),
            "gif" => Ok(ImageExt::Gif),
            other => Err(ImageError::Validation(ValidationKind::BadExtension(
                other.to_string(),
            ))),
        }
    }
}

impl fmt::Display for ImageExt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static DERIVATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?P<base>.+?)_(?P<w>\d+)x(?P<h>\d+)(?:_c(?P<c>\d+))?\.(?P<ext>png|jpg|jpeg|gif)$")
        .expect("derivative grammar")
});

// Looser than the request grammar: size and crop suffixes are optional so an
// already-sized name can be re-written, and bmp survives for legacy URLs.
static SIZED_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?P<base>.+?)(?:_(?P<w>\d+)x(?P<h>\d+))?(?:_c(?P<c>\d+))?\.(?P<ext>png|jpg|jpeg|gif|bmp)$",
    )
    .expect("sized name grammar")
});

static ABSOLUTE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://(?P<host>[^/]+)/(?P<path>.*)$").expect("absolute url grammar")
});

/// A parsed derivative request. The canonical rendering of this value names
/// the materialized file, so equal requests always hit the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivativeRequest {
    pub base_name: String,
    pub width: u32,
    pub height: u32,
    pub crop_mode: CropMode,
    pub ext: ImageExt,
}

impl DerivativeRequest {
    /// Parse `<baseName>_<width>x<height>(_c<cropMode>)?.<ext>`.
    pub fn parse(path: &str) -> Result<Self, ImageError> {
        let caps = DERIVATIVE_RE
            .captures(path)
            .ok_or(ImageError::NotFound(NotFoundKind::PatternMismatch))?;
        let width: u32 = caps["w"]
            .parse()
            .map_err(|_| ImageError::NotFound(NotFoundKind::PatternMismatch))?;
        let height: u32 = caps["h"]
            .parse()
            .map_err(|_| ImageError::NotFound(NotFoundKind::PatternMismatch))?;
        let crop_mode = match caps.name("c") {
            Some(m) => {
                let raw: u32 = m
                    .as_str()
                    .parse()
                    .map_err(|_| ImageError::NotFound(NotFoundKind::PatternMismatch))?;
                CropMode::try_from(raw)?
            }
            None => CropMode::default(),
        };
        let ext: ImageExt = caps["ext"].parse()?;
        Ok(DerivativeRequest {
            base_name: caps["base"].to_string(),
            width,
            height,
            crop_mode,
            ext,
        })
    }

    /// Canonical derivative file name; pure function of the request fields.
    pub fn key(&self) -> String {
        format!(
            "{}_{}x{}_c{}.{}",
            self.base_name, self.width, self.height, self.crop_mode as u8, self.ext
        )
    }

    /// File name of the original asset this derivative is cut from.
    pub fn original_name(&self) -> String {
        format!("{}.{}", self.base_name, self.ext)
    }

    /// `WxH` label checked against the size allow-list.
    pub fn size_label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Rewrite a stored path into an externally reachable sized URL.
///
/// Absolute URLs pointing at a foreign host pass through untouched; URLs on
/// one of our host aliases are reduced to their path first. When any sizing
/// parameter is requested, an existing `_WxH(_cN)?` suffix is replaced by the
/// requested one, so resolved URLs round-trip through the derivative grammar.
pub fn rewrite_sized_url(
    path: &str,
    width: u32,
    height: u32,
    mode: CropMode,
    protocol: &str,
    host: &str,
    host_aliases: &[String],
) -> String {
    if path.is_empty() {
        return String::new();
    }

    let mut rel = path.to_string();
    if let Some(caps) = ABSOLUTE_URL_RE.captures(path) {
        if !host_aliases.iter().any(|a| a == &caps["host"]) {
            return path.to_string();
        }
        rel = caps["path"].to_string();
    }

    if width != 0 || height != 0 || mode != CropMode::default() {
        let rewritten = SIZED_NAME_RE.captures(&rel).map(|caps| {
            format!(
                "{}_{}x{}_c{}.{}",
                &caps["base"],
                width,
                height,
                mode as u8,
                caps["ext"].to_ascii_lowercase()
            )
        });
        if let Some(r) = rewritten {
            rel = r;
        }
    }

    let sep = if rel.starts_with('/') { "" } else { "/" };
    if host.is_empty() {
        format!("{sep}{rel}")
    } else {
        format!("{protocol}://{host}{sep}{rel}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_grammar() {
        let req = DerivativeRequest::parse("avatars/a_120x80_c2.JPG").unwrap();
        assert_eq!(req.base_name, "avatars/a");
        assert_eq!((req.width, req.height), (120, 80));
        assert_eq!(req.crop_mode, CropMode::FitScaleWithPad);
        assert_eq!(req.ext, ImageExt::Jpg);
    }

    #[test]
    fn crop_suffix_defaults_to_zero() {
        let req = DerivativeRequest::parse("pic_60x60.png").unwrap();
        assert_eq!(req.crop_mode, CropMode::CenterCropScale);
        assert_eq!(req.key(), "pic_60x60_c0.png");
    }

    #[test]
    fn key_is_deterministic() {
        let a = DerivativeRequest::parse("x/y/photo_750x400_c1.jpeg").unwrap();
        let b = DerivativeRequest::parse("x/y/photo_750x400_c1.jpeg").unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.original_name(), "x/y/photo.jpeg");
        assert_eq!(a.size_label(), "750x400");
    }

    #[test]
    fn rejects_off_grammar_paths() {
        assert!(DerivativeRequest::parse("noext_10x10").is_err());
        assert!(DerivativeRequest::parse("plain.png").is_err());
        assert!(DerivativeRequest::parse("a_x10.png").is_err());
        assert!(DerivativeRequest::parse("a_10x10.webp").is_err());
    }

    #[test]
    fn unknown_crop_mode_is_a_config_error() {
        let err = DerivativeRequest::parse("a_10x10_c9.png").unwrap_err();
        assert_eq!(err.status(), 414);
    }

    #[test]
    fn rewrite_appends_size_suffix() {
        let url = rewrite_sized_url(
            "/uploads/a/pic.jpg",
            120,
            80,
            CropMode::FitScale,
            "https",
            "img.example.com",
            &[],
        );
        assert_eq!(url, "https://img.example.com/uploads/a/pic_120x80_c1.jpg");
    }

    #[test]
    fn rewrite_replaces_existing_suffix() {
        let url = rewrite_sized_url(
            "/uploads/pic_60x60_c0.jpg",
            120,
            120,
            CropMode::default(),
            "http",
            "img.example.com",
            &[],
        );
        assert_eq!(url, "http://img.example.com/uploads/pic_120x120_c0.jpg");
    }

    #[test]
    fn foreign_absolute_urls_pass_through() {
        let url = rewrite_sized_url(
            "http://cdn.elsewhere.net/pic.jpg",
            60,
            60,
            CropMode::default(),
            "http",
            "img.example.com",
            &["img.example.com".to_string()],
        );
        assert_eq!(url, "http://cdn.elsewhere.net/pic.jpg");
    }

    #[test]
    fn alias_absolute_urls_are_rewritten() {
        let url = rewrite_sized_url(
            "http://alias.example.com/uploads/pic.jpg",
            60,
            60,
            CropMode::default(),
            "http",
            "img.example.com",
            &["alias.example.com".to_string()],
        );
        assert_eq!(url, "http://img.example.com/uploads/pic_60x60_c0.jpg");
    }

    #[test]
    fn no_size_params_leaves_name_alone() {
        let url = rewrite_sized_url(
            "/uploads/pic.jpg",
            0,
            0,
            CropMode::default(),
            "http",
            "img.example.com",
            &[],
        );
        assert_eq!(url, "http://img.example.com/uploads/pic.jpg");
    }

    #[test]
    fn empty_path_stays_empty() {
        assert_eq!(
            rewrite_sized_url("", 1, 1, CropMode::default(), "http", "h", &[]),
            ""
        );
    }
}
