use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};

const DEFAULT_DATA_ROOT: &str = "/var/lib/map-warper";

fn override_config_path() -> Option<PathBuf> {
    std::env::var("WARPER_CONFIG_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    data_root: Option<String>,
    #[serde(default)]
    map_storage_path: Option<String>,
    #[serde(default)]
    mask_dir: Option<String>,
    #[serde(default)]
    tile_store_path: Option<String>,
    #[serde(default)]
    gdal_bin_dir: Option<String>,
    #[serde(default)]
    warp_timeout_seconds: Option<u64>,
    #[serde(default)]
    max_concurrent_warps: Option<usize>,
    #[serde(default)]
    publish_min_zoom: Option<u32>,
    #[serde(default)]
    publish_max_zoom: Option<u32>,
    #[serde(default)]
    publish_max_tiles: Option<usize>,
    #[serde(default)]
    wms_cache_entries: Option<usize>,
    #[serde(default)]
    geocoder_url: Option<String>,
}

fn load_overrides() -> Option<ConfigOverrides> {
    let path = override_config_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config override file missing; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read config overrides; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse config overrides; using env defaults"
            );
            None
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn apply_overrides(config: &mut WarperConfig, overrides: &ConfigOverrides) {
    if let Some(url) = non_empty(overrides.database_url.as_deref()) {
        config.database_url = Some(url.to_string());
    }
    if let Some(path) = non_empty(overrides.map_storage_path.as_deref()) {
        config.map_storage_path = PathBuf::from(path);
    }
    if let Some(path) = non_empty(overrides.mask_dir.as_deref()) {
        config.mask_dir = PathBuf::from(path);
    }
    if let Some(path) = non_empty(overrides.tile_store_path.as_deref()) {
        config.tile_store_path = PathBuf::from(path);
    }
    if let Some(path) = non_empty(overrides.gdal_bin_dir.as_deref()) {
        config.gdal_bin_dir = Some(PathBuf::from(path));
    }
    if let Some(value) = overrides.warp_timeout_seconds.filter(|v| *v != 0) {
        config.warp_timeout_seconds = value;
    }
    if let Some(value) = overrides.max_concurrent_warps.filter(|v| *v != 0) {
        config.max_concurrent_warps = value.min(64);
    }
    if let Some(value) = overrides.publish_min_zoom {
        config.publish_min_zoom = value.min(MAX_PUBLISH_ZOOM);
    }
    if let Some(value) = overrides.publish_max_zoom {
        config.publish_max_zoom = value.min(MAX_PUBLISH_ZOOM);
    }
    if let Some(value) = overrides.publish_max_tiles.filter(|v| *v != 0) {
        config.publish_max_tiles = value;
    }
    if let Some(value) = overrides.wms_cache_entries {
        config.wms_cache_entries = value;
    }
    if let Some(url) = non_empty(overrides.geocoder_url.as_deref()) {
        config.geocoder_url = Some(url.to_string());
    }
}

pub const MAX_PUBLISH_ZOOM: u32 = 22;

#[derive(Debug, Clone)]
pub struct WarperConfig {
    pub database_url: Option<String>,
    pub data_root: PathBuf,
    /// Uploads, masked working copies and warped output live under here.
    pub map_storage_path: PathBuf,
    pub mask_dir: PathBuf,
    pub tile_store_path: PathBuf,
    pub gdal_bin_dir: Option<PathBuf>,
    pub warp_timeout_seconds: u64,
    pub max_concurrent_warps: usize,
    pub publish_min_zoom: u32,
    pub publish_max_zoom: u32,
    pub publish_max_tiles: usize,
    pub wms_cache_entries: usize,
    pub geocoder_url: Option<String>,
}

impl WarperConfig {
    pub fn from_env() -> Result<Self> {
        let overrides = load_overrides();

        let data_root_value = env_optional_string("WARPER_DATA_ROOT")
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|ov| non_empty(ov.data_root.as_deref()))
                    .map(|value| value.to_string())
            })
            .unwrap_or_else(|| DEFAULT_DATA_ROOT.to_string());
        let data_root = PathBuf::from(data_root_value);
        if data_root.as_os_str().is_empty() {
            anyhow::bail!("WARPER_DATA_ROOT resolved to an empty path");
        }

        let storage_default = data_root.join("storage/maps");
        let map_storage_path = env_path(
            "WARPER_MAP_STORAGE_PATH",
            &storage_default.to_string_lossy(),
        )?;
        let mask_default = map_storage_path.join("masks");
        let mask_dir = env_path("WARPER_MASK_DIR", &mask_default.to_string_lossy())?;
        let tiles_default = data_root.join("storage/tiles");
        let tile_store_path = env_path("WARPER_TILE_STORE_PATH", &tiles_default.to_string_lossy())?;

        let mut config = Self {
            database_url: env_optional_string("WARPER_DATABASE_URL"),
            data_root,
            map_storage_path,
            mask_dir,
            tile_store_path,
            gdal_bin_dir: env_optional_path("WARPER_GDAL_BIN_DIR"),
            warp_timeout_seconds: env_u64("WARPER_WARP_TIMEOUT_SECONDS", 900).clamp(10, 6 * 3600),
            max_concurrent_warps: env_u64("WARPER_MAX_CONCURRENT_WARPS", 2).clamp(1, 64) as usize,
            publish_min_zoom: env_u32("WARPER_PUBLISH_MIN_ZOOM", 0).min(MAX_PUBLISH_ZOOM),
            publish_max_zoom: env_u32("WARPER_PUBLISH_MAX_ZOOM", 16).min(MAX_PUBLISH_ZOOM),
            publish_max_tiles: env_u64("WARPER_PUBLISH_MAX_TILES", 50_000).max(1) as usize,
            wms_cache_entries: env_u64("WARPER_WMS_CACHE_ENTRIES", 512) as usize,
            geocoder_url: env_optional_string("WARPER_GEOCODER_URL"),
        };

        if let Some(overrides) = overrides.as_ref() {
            apply_overrides(&mut config, overrides);
        }
        if env_bool("WARPER_DISABLE_GEOCODER", false) {
            config.geocoder_url = None;
        }
        if config.publish_min_zoom > config.publish_max_zoom {
            anyhow::bail!(
                "publish zoom range is empty ({}..={})",
                config.publish_min_zoom,
                config.publish_max_zoom
            );
        }

        config.validate_storage_paths()?;
        Ok(config)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.map_storage_path.join("uploads")
    }

    pub fn masked_dir(&self) -> PathBuf {
        self.map_storage_path.join("masked")
    }

    pub fn warped_dir(&self) -> PathBuf {
        self.map_storage_path.join("warped")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.map_storage_path.join("tmp")
    }

    /// Creates every storage directory the services write into.
    pub fn ensure_storage_dirs(&self) -> Result<()> {
        for dir in [
            self.uploads_dir(),
            self.masked_dir(),
            self.warped_dir(),
            self.work_dir(),
            self.mask_dir.clone(),
            self.tile_store_path.clone(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create storage dir {}", dir.display()))?;
        }
        Ok(())
    }

    fn validate_storage_paths(&mut self) -> Result<()> {
        self.data_root =
            validate_and_canonicalize_path(self.data_root.clone(), None, "WARPER_DATA_ROOT")?;
        self.map_storage_path = validate_and_canonicalize_path(
            self.map_storage_path.clone(),
            Some(&self.data_root),
            "WARPER_MAP_STORAGE_PATH",
        )?;
        self.mask_dir = validate_and_canonicalize_path(
            self.mask_dir.clone(),
            Some(&self.data_root),
            "WARPER_MASK_DIR",
        )?;
        self.tile_store_path = validate_and_canonicalize_path(
            self.tile_store_path.clone(),
            Some(&self.data_root),
            "WARPER_TILE_STORE_PATH",
        )?;
        Ok(())
    }
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|value| value.trim().to_lowercase())
    {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_optional_path(key: &str) -> Option<PathBuf> {
    env_optional_string(key).map(PathBuf::from)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    Ok(path)
}

pub(crate) fn validate_and_canonicalize_path(
    path: PathBuf,
    base: Option<&Path>,
    label: &str,
) -> Result<PathBuf> {
    if !path.is_absolute() {
        anyhow::bail!("{label} must be an absolute path");
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            anyhow::bail!("{label} must not contain '..' segments");
        }
    }
    let canonical = canonicalize_with_existing_parent(&path)
        .with_context(|| format!("failed to canonicalize {label} ({})", path.display()))?;
    if let Some(base) = base {
        let base = canonicalize_with_existing_parent(base)
            .with_context(|| format!("failed to canonicalize base for {label}"))?;
        if !canonical.starts_with(&base) {
            anyhow::bail!("{label} must reside under {}", base.display());
        }
    }
    Ok(canonical)
}

fn canonicalize_with_existing_parent(path: &Path) -> Result<PathBuf> {
    let mut existing = None;
    for ancestor in path.ancestors() {
        if ancestor.exists() {
            existing = Some(ancestor);
            break;
        }
    }
    let Some(existing) = existing else {
        anyhow::bail!("no existing ancestor found for path {}", path.display());
    };
    let base = existing
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", existing.display()))?;
    let suffix = path.strip_prefix(existing).unwrap_or(Path::new(""));
    // Joining an empty suffix would append a trailing separator.
    if suffix.as_os_str().is_empty() {
        return Ok(base);
    }
    Ok(base.join(suffix))
}
