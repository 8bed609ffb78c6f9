//! File-based engine configuration.
//!
//! Scalar engine options can be kept in INI files instead of code. Files are
//! searched with the following precedence:
//!
//! 1. Local configuration (`./dlfind.cfg`)
//! 2. User configuration (`~/.config/dlfind/dlfind.cfg`)
//! 3. System configuration (`/etc/dlfind/dlfind.cfg`)
//!
//! Layers are merged field by field, so a local file only needs the options it
//! changes. Options that no layer sets are never written, and the engine keeps
//! its own defaults for them.
//!
//! # Configuration File Format
//!
//! All options live in a single `[dlfind]` section. Keys are the engine's
//! option names; float values accept Fortran exponents.
//!
//! ```ini
//! [dlfind]
//! iopt = 3
//! tolerance = 4.5d-4
//! maxcycle = 200
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use dlfind::settings::SettingsManager;
//!
//! let settings = SettingsManager::load()?;
//! println!("Engine options loaded from: {}", settings.config_source());
//! # Ok::<(), dlfind::settings::ConfigError>(())
//! ```

use crate::params::{DlfParams, ParamsError, FIELDS};
use configparser::ini::Ini;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the INI section holding engine options.
pub const SECTION: &str = "dlfind";

/// File name searched for in every configuration directory.
pub const FILE_NAME: &str = "dlfind.cfg";

/// Errors that can occur during configuration loading and processing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading or writing configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Missing required configuration section
    #[error("Missing required section: [{0}]")]
    MissingSection(String),
    /// Key or value rejected by the engine option table
    #[error("Invalid engine option: {0}")]
    Params(#[from] ParamsError),
    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine options assembled from configuration files.
#[derive(Debug, Clone)]
pub struct SettingsManager {
    params: DlfParams,
    config_source: String,
}

impl SettingsManager {
    /// Loads engine options from the standard configuration locations.
    ///
    /// Searches for configuration files in the following order, later files
    /// overriding earlier ones field by field:
    /// 1. `/etc/dlfind/dlfind.cfg` (system configuration)
    /// 2. `~/.config/dlfind/dlfind.cfg` (user configuration)
    /// 3. `./dlfind.cfg` (current working directory)
    ///
    /// A layer that exists but cannot be read or contains a rejected option
    /// is skipped with a warning.
    ///
    /// # Returns
    ///
    /// Returns a `Result` containing:
    /// - `Ok(SettingsManager)` - The merged options, possibly empty
    /// - `Err(ConfigError)` - Configuration loading failed
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dlfind::params::DlfParams;
    /// use dlfind::settings::SettingsManager;
    ///
    /// let settings = SettingsManager::load()?;
    /// let params = settings.apply_to(DlfParams::standard(vec![[0.0; 3]]));
    /// println!("{} options from {}", params.scalar_count(), settings.config_source());
    /// # Ok::<(), dlfind::settings::ConfigError>(())
    /// ```
    pub fn load() -> Result<Self, ConfigError> {
        let layers = [
            Self::get_system_config_path(),
            Self::get_user_config_path(),
            Some(PathBuf::from(FILE_NAME)),
        ];
        let settings = Self::load_layers(layers.into_iter().flatten());
        info!("Engine options loaded from: {}", settings.config_source);
        Ok(settings)
    }

    /// Merges the given files in order, later files overriding earlier ones.
    /// Missing files are ignored.
    pub fn load_layers<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut params = DlfParams::default();
        let mut config_source = "built-in defaults".to_string();

        for path in paths {
            if !path.exists() {
                continue;
            }
            match Self::load_config(&path) {
                Ok(layer) => {
                    debug!(
                        "Loaded {} engine options from: {}",
                        layer.scalar_count(),
                        path.display()
                    );
                    params.merge(&layer);
                    config_source = path.display().to_string();
                }
                Err(e) => {
                    warn!("Failed to load config from {}: {}", path.display(), e);
                }
            }
        }

        Self {
            params,
            config_source,
        }
    }

    /// Loads a single file. The `[dlfind]` section is required and every key
    /// in it must name an engine option.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let params = Self::load_config(path)?;
        info!(
            "Loaded {} engine options from: {}",
            params.scalar_count(),
            path.display()
        );
        Ok(Self {
            params,
            config_source: path.display().to_string(),
        })
    }

    /// Where the options came from.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// The merged options. Arrays are never set from files.
    pub fn params(&self) -> &DlfParams {
        &self.params
    }

    /// Applies the file options on top of `base`; file values win.
    pub fn apply_to(&self, mut base: DlfParams) -> DlfParams {
        base.merge(&self.params);
        base
    }

    /// Consumes the manager, returning the merged options.
    pub fn into_params(self) -> DlfParams {
        self.params
    }

    fn load_config(path: &Path) -> Result<DlfParams, ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut ini = Ini::new();
        ini.read(content)
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;

        let section = ini
            .get_map_ref()
            .get(SECTION)
            .ok_or_else(|| ConfigError::MissingSection(SECTION.to_string()))?;
        Self::parse_section(section)
    }

    fn parse_section(
        section: &HashMap<String, Option<String>>,
    ) -> Result<DlfParams, ConfigError> {
        let mut params = DlfParams::default();
        for (key, value) in section {
            match value {
                Some(text) => params.set_str(key, text)?,
                None => {
                    return Err(ParamsError::InvalidValue {
                        field: key.clone(),
                        value: String::new(),
                    }
                    .into())
                }
            }
        }
        Ok(params)
    }

    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/dlfind").join(FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("dlfind").join(FILE_NAME))
        }
    }

    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("dlfind")
                    .join(FILE_NAME)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("dlfind").join(FILE_NAME))
        }
    }
}

impl SettingsManager {
    /// Writes a configuration template listing every engine option, all
    /// commented out.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let mut content = String::from(
            r#"# DL-FIND engine options
#
# Files are loaded in hierarchical order with local settings taking precedence:
#
# 1. Current working directory (./dlfind.cfg) - highest priority
# 2. User config directory (~/.config/dlfind/dlfind.cfg)
# 3. System config directory (/etc/dlfind/dlfind.cfg)
#
# Options left commented out are not passed to DL-FIND, which then uses its
# own defaults. Float options accept Fortran exponents (1.0d-4).

[dlfind]
"#,
        );
        for field in FIELDS {
            content.push_str(&format!("# {} = ({})\n", field.name, field.kind));
        }
        content
    }
}
