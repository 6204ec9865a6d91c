use crate::crop::CropMode;
use crate::error::ImageError;
use crate::naming::ImageExt;
use async_trait::async_trait;
use std::path::PathBuf;

/// An upload that passed validation, ready to be persisted.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub original_name: String,
    pub ext: ImageExt,
    pub bytes: Vec<u8>,
}

/// Per-save hints from the upload request.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Extra directory segment under the upload root; already charset-checked.
    pub dir: String,
    pub protocol: String,
}

/// Where a save landed. `path` is the scheme-qualified location key the rest
/// of the system stores; `full_path` is backend-internal and never leaves
/// the process.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub path: String,
    pub url: String,
    pub full_path: Option<PathBuf>,
}

/// Capability interface every storage backend implements. Ownership of the
/// bytes behind a location key belongs to exactly one backend, identified by
/// the scheme prefix.
#[async_trait]
pub trait ImageStorage: Send + Sync {
    /// Scheme prefix on location keys this backend owns.
    fn scheme(&self) -> &'static str;

    /// Persist the image and return its location and public URL.
    async fn save(&self, file: &UploadedImage, opts: &SaveOptions) -> Result<StoredImage, ImageError>;

    /// Build the externally reachable URL for a stored location, embedding
    /// the transform parameters this backend can express and ignoring the
    /// rest. Strips our own scheme prefix first.
    fn resolve_url(&self, path: &str, width: u32, height: u32, mode: CropMode, protocol: &str)
        -> String;
}

/// Random lowercase-alphanumeric suffix used in allocated file names.
pub(crate) fn random_suffix(len: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
