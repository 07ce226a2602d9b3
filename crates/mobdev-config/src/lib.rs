use std::fs;
use std::path::{Path, PathBuf};
use directories::BaseDirs;
use mobdev_traits::config::{Config, ConfigError, ConfigService};

pub struct ConfigServiceImpl;

impl ConfigServiceImpl {
    fn read(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

impl ConfigService for ConfigServiceImpl {
    fn load_from_paths(explicit: Option<&Path>) -> Result<Config, ConfigError> {
        if let Some(path) = explicit {
            let path = Self::expand_tilde(path).unwrap_or_else(|| path.to_path_buf());
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_string_lossy().into_owned()));
            }
            return Self::read(&path);
        }

        let home_dir_path = BaseDirs::new().map(|dirs| {
            dirs.home_dir().join(".mobdev/config.json")
        });

        let current_dir_path = Path::new("./config.json").to_path_buf();

        let paths_to_check = [
            home_dir_path,
            Some(current_dir_path)
        ];

        for path in paths_to_check.iter().flatten() {
            if path.exists() {
                return Self::read(path);
            }
        }

        // If no config file is found, return a config with all `None` values.
        Ok(Config::empty())
    }

    fn expand_tilde<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
        let path = path.as_ref();
        let Ok(rest) = path.strip_prefix("~") else {
            return Some(path.to_path_buf());
        };

        BaseDirs::new().map(|dirs| dirs.home_dir().join(rest))
    }
}
