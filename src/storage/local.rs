use super::backend::{random_suffix, ImageStorage, SaveOptions, StoredImage, UploadedImage};
use crate::config::Config;
use crate::crop::CropMode;
use crate::error::{ConfigKind, ImageError, StorageKind};
use crate::naming;
use async_trait::async_trait;
use chrono::Local;
use std::path::PathBuf;

pub const SCHEME: &str = "file";

/// Local filesystem backend. Files land under a date-sharded directory
/// below the upload root and are addressed by root-relative paths.
pub struct LocalFileStorage {
    site_base_dir: PathBuf,
    upload_dir: String,
    host: String,
    host_aliases: Vec<String>,
}

impl LocalFileStorage {
    pub fn new(config: &Config) -> Result<Self, ImageError> {
        let missing = |p: &std::path::Path| {
            ImageError::Config(ConfigKind::MissingRoot(p.display().to_string()))
        };
        if !config.site_base_dir.is_dir() {
            return Err(missing(&config.site_base_dir));
        }
        if !config.upload_base().is_dir() {
            return Err(missing(&config.upload_base()));
        }
        Ok(LocalFileStorage {
            site_base_dir: config.site_base_dir.clone(),
            upload_dir: config.upload_dir.clone(),
            host: config.img_host.clone(),
            host_aliases: config.img_host_aliases.clone(),
        })
    }

    /// Allocate a fresh site-relative path `/{middle}/{YYYYMMDD}/{HHMMSS}{rand6}.{ext}`,
    /// creating parent directories. Three attempts before giving up.
    fn alloc_path(&self, middle_paths: &[&str], ext: &str) -> Result<String, ImageError> {
        let now = Local::now();
        let middle: Vec<&str> = middle_paths
            .iter()
            .map(|s| s.trim_matches('/'))
            .filter(|s| !s.is_empty())
            .collect();
        let prefix = format!(
            "/{}/{}/{}",
            middle.join("/"),
            now.format("%Y%m%d"),
            now.format("%H%M%S")
        );

        for _ in 0..3 {
            let rel = format!("{}{}.{}", prefix, random_suffix(6), ext);
            let full = self.full_path(&rel);
            if full.is_file() {
                continue;
            }
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ImageError::Storage(StorageKind::MoveFailed(e.to_string())))?;
            }
            return Ok(rel);
        }
        Err(ImageError::Storage(StorageKind::AllocationExhausted))
    }

    fn full_path(&self, site_relative: &str) -> PathBuf {
        self.site_base_dir
            .join(site_relative.trim_start_matches('/'))
    }
}

#[async_trait]
impl ImageStorage for LocalFileStorage {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    async fn save(
        &self,
        file: &UploadedImage,
        opts: &SaveOptions,
    ) -> Result<StoredImage, ImageError> {
        let rel = self.alloc_path(&[&self.upload_dir, &opts.dir], file.ext.as_str())?;
        let full = self.full_path(&rel);

        tokio::fs::write(&full, &file.bytes)
            .await
            .map_err(|e| ImageError::Storage(StorageKind::MoveFailed(e.to_string())))?;

        let url = if self.host.is_empty() {
            rel.clone()
        } else {
            format!("http://{}{}", self.host, rel)
        };

        Ok(StoredImage {
            path: format!("{SCHEME}://{rel}"),
            url,
            full_path: Some(full),
        })
    }

    fn resolve_url(
        &self,
        path: &str,
        width: u32,
        height: u32,
        mode: CropMode,
        protocol: &str,
    ) -> String {
        let rel = path.strip_prefix(&format!("{SCHEME}://")).unwrap_or(path);
        naming::rewrite_sized_url(
            rel,
            width,
            height,
            mode,
            protocol,
            &self.host,
            &self.host_aliases,
        )
    }
}
