use super::backend::{random_suffix, ImageStorage, SaveOptions, StoredImage, UploadedImage};
use crate::config::Config;
use crate::crop::CropMode;
use crate::error::{ConfigKind, ImageError, StorageKind};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Local;
use serde::Deserialize;
use sha1::{Digest, Sha1};

pub const SCHEME: &str = "cdn";

/// Remote CDN backend. Uploads go through the provider's authenticated HTTP
/// API; retrieval URLs carry the provider's own resizing query parameters,
/// so no derivative is ever materialized on our side for these assets.
pub struct CdnStorage {
    access_key: String,
    secret_key: String,
    bucket: String,
    access_domain: String,
    upload_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CdnUploadResponse {
    key: Option<String>,
    error: Option<String>,
}

impl CdnStorage {
    pub fn new(config: &Config) -> Result<Self, ImageError> {
        let require = |field: &Option<String>, _name: &str| {
            field
                .clone()
                .ok_or_else(|| ImageError::Config(ConfigKind::MissingCredentials(SCHEME.into())))
        };
        Ok(CdnStorage {
            access_key: require(&config.cdn_access_key, "access key")?,
            secret_key: require(&config.cdn_secret_key, "secret key")?,
            bucket: require(&config.cdn_bucket, "bucket")?,
            access_domain: require(&config.cdn_access_domain, "access domain")?,
            upload_url: require(&config.cdn_upload_url, "upload url")?,
            client: reqwest::Client::new(),
        })
    }

    fn alloc_key(&self, dir: &str, ext: &str) -> String {
        let date = Local::now().format("%Y%m%d").to_string();
        let name = format!("{}.{}", random_suffix(6), ext);
        [dir.trim_matches('/'), &date, &name]
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Upload token: access key plus a SHA1 signature over the secret and
    /// the object key, the shape the provider's API expects.
    fn upload_token(&self, key: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.secret_key.as_bytes());
        hasher.update(key.as_bytes());
        format!(
            "{}:{}",
            self.access_key,
            URL_SAFE_NO_PAD.encode(hasher.finalize())
        )
    }

    /// Translate our crop modes onto the provider's two resize modes.
    /// Fit-style modes map to the provider's "fit inside" (0); everything
    /// else, including StretchScale and TopLeftCrop which have no remote
    /// equivalent, degrades to "scale and center-crop" (1).
    fn remote_mode(mode: CropMode) -> u8 {
        match mode {
            CropMode::FitScale | CropMode::FitScaleWithPad => 0,
            CropMode::CenterCropScale | CropMode::StretchScale | CropMode::TopLeftCrop => 1,
        }
    }
}

#[async_trait]
impl ImageStorage for CdnStorage {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    async fn save(
        &self,
        file: &UploadedImage,
        opts: &SaveOptions,
    ) -> Result<StoredImage, ImageError> {
        let key = self.alloc_key(&opts.dir, file.ext.as_str());
        let remote_fault = |msg: String| ImageError::Storage(StorageKind::RemoteApiFault(msg));

        let form = reqwest::multipart::Form::new()
            .text("bucket", self.bucket.clone())
            .text("key", key.clone())
            .text("token", self.upload_token(&key))
            .part(
                "file",
                reqwest::multipart::Part::bytes(file.bytes.clone())
                    .file_name(file.original_name.clone())
                    .mime_str(file.ext.content_type())
                    .map_err(|e| remote_fault(e.to_string()))?,
            );

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| remote_fault(e.to_string()))?;

        if !response.status().is_success() {
            return Err(remote_fault(format!("upload returned {}", response.status())));
        }

        let body: CdnUploadResponse = response
            .json()
            .await
            .map_err(|e| remote_fault(e.to_string()))?;
        if let Some(err) = body.error {
            return Err(remote_fault(err));
        }
        let key = body
            .key
            .ok_or_else(|| remote_fault("upload response carried no key".to_string()))?;

        let protocol = if opts.protocol.is_empty() { "http" } else { &opts.protocol };
        Ok(StoredImage {
            path: format!("{SCHEME}://{key}"),
            url: format!("{}://{}/{}", protocol, self.access_domain, key),
            full_path: None,
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
        let key = path.strip_prefix(&format!("{SCHEME}://")).unwrap_or(path);
        if key.is_empty() {
            return String::new();
        }
        let mut url = format!(
            "{}://{}{}{}",
            protocol,
            self.access_domain,
            if key.starts_with('/') { "" } else { "/" },
            key
        );
        if width != 0 || height != 0 || mode != CropMode::default() {
            url.push_str(&format!(
                "?imageView2/{}/w/{}/h/{}",
                Self::remote_mode(mode),
                width,
                height
            ));
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageScheme;
    use std::collections::HashSet;

    fn cdn_config() -> Config {
        Config {
            img_host: String::new(),
            img_host_aliases: vec![],
            enable_all_sizes: false,
            image_sizes: HashSet::new(),
            max_upload_size: 1 << 20,
            site_base_dir: std::path::PathBuf::from("/tmp"),
            upload_dir: "uploads".to_string(),
            default_storage: StorageScheme::Cdn,
            enabled_storage: vec![StorageScheme::Cdn],
            allow_storage_override: false,
            index_path: std::path::PathBuf::from("/tmp/index.json"),
            cdn_access_key: Some("ak".to_string()),
            cdn_secret_key: Some("sk".to_string()),
            cdn_bucket: Some("bucket".to_string()),
            cdn_access_domain: Some("cdn.example.com".to_string()),
            cdn_upload_url: Some("https://up.example.com/put".to_string()),
            server_port: 0,
        }
    }

    #[test]
    fn missing_credentials_fail_configuration() {
        let mut config = cdn_config();
        config.cdn_secret_key = None;
        assert!(matches!(
            CdnStorage::new(&config),
            Err(ImageError::Config(ConfigKind::MissingCredentials(_)))
        ));
    }

    #[test]
    fn resolve_url_embeds_provider_resize_params() {
        let storage = CdnStorage::new(&cdn_config()).unwrap();
        let url = storage.resolve_url("cdn://a/b/pic.jpg", 120, 80, CropMode::FitScale, "https");
        assert_eq!(url, "https://cdn.example.com/a/b/pic.jpg?imageView2/0/w/120/h/80");
    }

    #[test]
    fn unsupported_modes_degrade_to_center_crop() {
        assert_eq!(CdnStorage::remote_mode(CropMode::StretchScale), 1);
        assert_eq!(CdnStorage::remote_mode(CropMode::TopLeftCrop), 1);
        assert_eq!(CdnStorage::remote_mode(CropMode::CenterCropScale), 1);
        assert_eq!(CdnStorage::remote_mode(CropMode::FitScaleWithPad), 0);
    }

    #[test]
    fn plain_urls_carry_no_params() {
        let storage = CdnStorage::new(&cdn_config()).unwrap();
        let url = storage.resolve_url("cdn://pic.jpg", 0, 0, CropMode::default(), "http");
        assert_eq!(url, "http://cdn.example.com/pic.jpg");
    }

    #[test]
    fn upload_token_is_deterministic_per_key() {
        let storage = CdnStorage::new(&cdn_config()).unwrap();
        assert_eq!(storage.upload_token("k"), storage.upload_token("k"));
        assert_ne!(storage.upload_token("k"), storage.upload_token("other"));
        assert!(storage.upload_token("k").starts_with("ak:"));
    }
}
