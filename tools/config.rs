use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use mirror::{DEFAULT_BITRATE_KBPS, DEFAULT_ENCODER};
use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;
pub const MAX_SCAN_WORKERS: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub program: String,
    pub bitrate_kbps: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_ENCODER.to_string(),
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub version: u32,
    pub music_root: String,
    pub snapshot_path: String,
    pub rescan: bool,
    pub scan_workers: usize,
    pub strict_checksums: bool,
    pub collection_path: String,
    pub mobile_root: String,
    pub sync_mobile: bool,
    pub encoder: EncoderConfig,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            music_root: "".to_string(),
            snapshot_path: "library.snapshot".to_string(),
            rescan: false,
            scan_workers: 1,
            strict_checksums: false,
            collection_path: "".to_string(),
            mobile_root: "".to_string(),
            sync_mobile: false,
            encoder: EncoderConfig::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("CATALOG_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

/// Reads the config at `path`, writing the defaults there first when it does
/// not exist. The flag is true when the file was just created.
pub fn load_or_create_config(path: &Path) -> Result<(CatalogConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: CatalogConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        config.scan_workers = config.scan_workers.clamp(1, MAX_SCAN_WORKERS);
        if config.encoder.program.trim().is_empty() {
            config.encoder.program = DEFAULT_ENCODER.to_string();
        }
        if config.encoder.bitrate_kbps == 0 {
            config.encoder.bitrate_kbps = DEFAULT_BITRATE_KBPS;
        }
        return Ok((config, false));
    }

    let config = CatalogConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &CatalogConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

/// `None` for a blank setting.
pub fn resolve_optional(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert_eq!(config, CatalogConfig::default());
        assert!(path.exists());

        let (reloaded, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(reloaded, config);
    }

    #[test]
    fn loaded_values_are_normalised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "version: 0\nmusic_root: /music\nscan_workers: 500\nencoder:\n  program: ''\n",
        )
        .unwrap();
        let (config, _) = load_or_create_config(&path).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.music_root, "/music");
        assert_eq!(config.scan_workers, MAX_SCAN_WORKERS);
        assert_eq!(config.encoder.program, DEFAULT_ENCODER);
        assert_eq!(config.encoder.bitrate_kbps, DEFAULT_BITRATE_KBPS);
        assert_eq!(config.snapshot_path, "library.snapshot");

        fs::write(&path, "scan_workers: 0\n").unwrap();
        let (config, _) = load_or_create_config(&path).unwrap();
        assert_eq!(config.scan_workers, 1);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "scan_workers: [not, a, number]\n").unwrap();
        assert!(matches!(load_or_create_config(&path), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn relative_paths_resolve_against_the_config_directory() {
        let config_path = Path::new("/etc/catalog/config.yaml");
        assert_eq!(
            resolve_path(config_path, "library.snapshot"),
            PathBuf::from("/etc/catalog/library.snapshot")
        );
        assert_eq!(resolve_path(config_path, "/var/music"), PathBuf::from("/var/music"));
        assert_eq!(
            resolve_path(Path::new("config.yaml"), "x"),
            PathBuf::from("./x")
        );
        assert_eq!(resolve_optional(config_path, "  "), None);
    }
}
