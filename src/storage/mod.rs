pub mod backend;
pub mod local;
pub mod remote;

pub use backend::{ImageStorage, SaveOptions, StoredImage, UploadedImage};
pub use local::LocalFileStorage;
pub use remote::CdnStorage;

use crate::config::{Config, StorageScheme};
use crate::crop::CropMode;
use crate::error::{ConfigKind, ImageError};
use std::collections::HashMap;
use std::sync::Arc;

/// Fixed set of storage backends built once from configuration. Selection
/// is by scheme name; there is no runtime extensibility.
pub struct StorageRegistry {
    backends: HashMap<&'static str, Arc<dyn ImageStorage>>,
    default: &'static str,
    allow_override: bool,
}

impl StorageRegistry {
    pub fn from_config(config: &Config) -> Result<Self, ImageError> {
        let mut backends: HashMap<&'static str, Arc<dyn ImageStorage>> = HashMap::new();
        for scheme in &config.enabled_storage {
            let built: Arc<dyn ImageStorage> = match scheme {
                StorageScheme::File => Arc::new(LocalFileStorage::new(config)?),
                StorageScheme::Cdn => Arc::new(CdnStorage::new(config)?),
            };
            backends.insert(built.scheme(), built);
        }
        let default = config.default_storage.as_str();
        if !backends.contains_key(default) {
            return Err(ImageError::Config(ConfigKind::UnknownBackend(
                default.to_string(),
            )));
        }
        Ok(StorageRegistry {
            backends,
            default,
            allow_override: config.allow_storage_override,
        })
    }

    /// Resolve the backend for a request: the explicit name when overrides
    /// are enabled, otherwise the configured default.
    pub fn select(&self, requested: Option<&str>) -> Result<Arc<dyn ImageStorage>, ImageError> {
        let name = match requested {
            Some(name) if self.allow_override => name,
            _ => self.default,
        };
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| ImageError::Config(ConfigKind::UnknownBackend(name.to_string())))
    }

    /// Backend owning a stored location key, identified by its scheme prefix.
    pub fn for_location(&self, path: &str) -> Result<Arc<dyn ImageStorage>, ImageError> {
        let scheme = path.split("://").next().unwrap_or("");
        self.backends
            .get(scheme)
            .cloned()
            .ok_or_else(|| ImageError::Config(ConfigKind::UnknownBackend(scheme.to_string())))
    }

    /// Resolve a stored location to a public URL through its owning backend.
    pub fn resolve_url(
        &self,
        path: &str,
        width: u32,
        height: u32,
        mode: CropMode,
        protocol: &str,
    ) -> Result<String, ImageError> {
        Ok(self
            .for_location(path)?
            .resolve_url(path, width, height, mode, protocol))
    }
}
