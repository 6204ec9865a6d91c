use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Default (width, height) allow-list; `0` on an axis means "auto".
const DEFAULT_IMAGE_SIZES: &[&str] = &[
    "0x0", "60x60", "120x120", "140x140", "240x240", "750x400", "750x430", "320x0", "375x0",
    "414x0", "640x0", "750x0", "828x0", "960x0", "1000x0", "1080x0", "1232x0", "1280x0", "0x480",
    "0x960",
];

#[derive(Debug, Clone)]
pub struct Config {
    /// Host used when building public image URLs; empty means path-only URLs.
    pub img_host: String,
    /// Hosts treated as our own when rewriting absolute URLs.
    pub img_host_aliases: Vec<String>,
    /// When set, the size allow-list is bypassed entirely.
    pub enable_all_sizes: bool,
    /// Allowed `WxH` labels for derivative generation.
    pub image_sizes: HashSet<String>,
    /// Maximum accepted upload, in bytes.
    pub max_upload_size: usize,
    /// Directory the public site is served from.
    pub site_base_dir: PathBuf,
    /// Upload directory, relative to `site_base_dir`.
    pub upload_dir: String,
    /// Backend used when the request does not pick one.
    pub default_storage: StorageScheme,
    /// Backends the registry instantiates.
    pub enabled_storage: Vec<StorageScheme>,
    /// Whether the `storage` upload field may override the default backend.
    pub allow_storage_override: bool,
    /// Dedup index location.
    pub index_path: PathBuf,
    pub cdn_access_key: Option<String>,
    pub cdn_secret_key: Option<String>,
    pub cdn_bucket: Option<String>,
    pub cdn_access_domain: Option<String>,
    pub cdn_upload_url: Option<String>,
    pub server_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageScheme {
    File,
    Cdn,
}

impl StorageScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageScheme::File => "file",
            StorageScheme::Cdn => "cdn",
        }
    }
}

impl FromStr for StorageScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(StorageScheme::File),
            "cdn" => Ok(StorageScheme::Cdn),
            _ => Err(anyhow::anyhow!("Invalid storage scheme: {}", s)),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let site_base_dir = PathBuf::from(
            env::var("SITE_BASE_DIR").map_err(|_| anyhow::anyhow!("SITE_BASE_DIR must be set"))?,
        );

        let enabled_storage = env::var("ENABLED_STORAGE")
            .unwrap_or_else(|_| "file".to_string())
            .split(',')
            .map(|s| s.trim().parse::<StorageScheme>())
            .collect::<Result<Vec<_>, _>>()?;

        let image_sizes = match env::var("IMAGE_SIZES") {
            Ok(raw) => raw.split(',').map(|s| s.trim().to_string()).collect(),
            Err(_) => DEFAULT_IMAGE_SIZES.iter().map(|s| s.to_string()).collect(),
        };

        let index_path = env::var("INDEX_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| site_base_dir.join("flex-image-index.json"));

        Ok(Config {
            img_host: env::var("IMG_HOST").unwrap_or_default(),
            img_host_aliases: env::var("IMG_HOST_ALIASES")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            enable_all_sizes: env_flag("ENABLE_ALL_SIZES"),
            image_sizes,
            max_upload_size: env::var("MAX_UPLOAD_SIZE")
                .unwrap_or_else(|_| "2097152".to_string())
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid MAX_UPLOAD_SIZE: {}", e))?,
            site_base_dir,
            upload_dir: env::var("UPLOAD_DIR")
                .unwrap_or_else(|_| "uploads".to_string())
                .trim_matches('/')
                .to_string(),
            default_storage: env::var("DEFAULT_STORAGE")
                .unwrap_or_else(|_| "file".to_string())
                .parse()?,
            enabled_storage,
            allow_storage_override: env_flag("ALLOW_STORAGE_OVERRIDE"),
            index_path,
            cdn_access_key: env::var("CDN_ACCESS_KEY").ok(),
            cdn_secret_key: env::var("CDN_SECRET_KEY").ok(),
            cdn_bucket: env::var("CDN_BUCKET").ok(),
            cdn_access_domain: env::var("CDN_ACCESS_DOMAIN").ok(),
            cdn_upload_url: env::var("CDN_UPLOAD_URL").ok(),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid SERVER_PORT: {}", e))?,
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.site_base_dir.is_dir() {
            return Err(anyhow::anyhow!(
                "SITE_BASE_DIR does not exist: {}",
                self.site_base_dir.display()
            ));
        }
        if !self.upload_base().is_dir() {
            return Err(anyhow::anyhow!(
                "upload directory does not exist: {}",
                self.upload_base().display()
            ));
        }
        if !self.enabled_storage.contains(&self.default_storage) {
            return Err(anyhow::anyhow!(
                "DEFAULT_STORAGE {} is not in ENABLED_STORAGE",
                self.default_storage.as_str()
            ));
        }
        if self.enabled_storage.contains(&StorageScheme::Cdn)
            && (self.cdn_access_key.is_none()
                || self.cdn_secret_key.is_none()
                || self.cdn_bucket.is_none()
                || self.cdn_access_domain.is_none()
                || self.cdn_upload_url.is_none())
        {
            return Err(anyhow::anyhow!(
                "CDN_ACCESS_KEY, CDN_SECRET_KEY, CDN_BUCKET, CDN_ACCESS_DOMAIN and CDN_UPLOAD_URL must be set for cdn storage"
            ));
        }
        Ok(())
    }

    /// Absolute path the derivative resolver serves from.
    pub fn upload_base(&self) -> PathBuf {
        self.site_base_dir.join(&self.upload_dir)
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => !matches!(v.to_lowercase().as_str(), "" | "false" | "no" | "0"),
        Err(_) => false,
    }
}
