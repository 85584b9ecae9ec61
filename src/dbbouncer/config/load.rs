use std::borrow::Cow;
use std::env;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::{Captures, Regex};
use tracing::{debug, info, info_span};

use crate::dbbouncer::common::{Error, Result};
use crate::dbbouncer::config::settings::Settings;

/// Load configuration settings from `dbbouncer.yaml`, searching in order:
/// 1) the path given as the first command line argument
/// 2) the current directory, then any of its parents, up to root
/// 3) `~/.config/dbbouncer/`
/// 4) `~/.dbbouncer.yaml`
/// 5) `/etc/dbbouncer/`
///
/// `${ENV_VAR[:default]}` references in the file are replaced with the named
/// environment variable, falling back to `default` (or failing the load if there's
/// no default and the variable is unset).
pub fn load_config(config_name: &str) -> Result<Settings> {
    let _span = info_span!("loading config file").entered();
    let config_path = find_config_file(config_name)?;
    info!(config_path = %config_path.to_string_lossy(), "found config file");
    let raw_yaml = std::fs::read_to_string(&config_path)?;
    let yaml_text = replace_env_vars(&raw_yaml)?;
    let settings: Settings = serde_yaml::from_str(&yaml_text)?;
    settings.validate()?;
    Ok(settings)
}

/// Reload the settings at `path`, returning `Ok(None)` if the file's mtime hasn't
/// changed since `last_modified`. Used by the hot-reload poller with the 500ms
/// debounce named in the config settings.
pub fn reload_if_changed(path: &Path, last_modified: SystemTime) -> Result<Option<(Settings, SystemTime)>> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified()?;
    if modified <= last_modified {
        return Ok(None);
    }
    let raw_yaml = std::fs::read_to_string(path)?;
    let yaml_text = replace_env_vars(&raw_yaml)?;
    let settings: Settings = serde_yaml::from_str(&yaml_text)?;
    settings.validate()?;
    Ok(Some((settings, modified)))
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    if let Some(path) = env::args().nth(1) {
        debug!("using config path passed on command line");
        return Ok(PathBuf::from(path));
    }

    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        loop {
            let fp = dir.join(config_name);
            debug!("checking for config file in {}", dir.to_string_lossy());
            if fp.exists() {
                return Ok(fp);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());

    let conf_path = Path::new(&home).join(".config/dbbouncer").join(config_name);
    if conf_path.exists() {
        return Ok(conf_path);
    }

    let conf_path = Path::new(&home).join(format!(".{}", config_name));
    if conf_path.exists() {
        return Ok(conf_path);
    }

    let conf_path = Path::new("/etc/dbbouncer").join(config_name);
    if conf_path.exists() {
        return Ok(conf_path);
    }

    Err(Error::config_invalid(format!("config file {} not found", config_name)))
}

fn replace_env_vars(raw_yaml: &str) -> Result<Cow<str>> {
    let re_var = Regex::new(r"\$\{([a-zA-Z_][0-9a-zA-Z_]*)(?::([^}]+?))?\}").unwrap();

    let mut errors = Vec::<String>::new();

    let replaced_text = re_var.replace_all(raw_yaml, |caps: &Captures| {
        match env::var(&caps[1]) {
            Ok(val) => val,
            Err(_) => {
                if let Some(default) = caps.get(2) {
                    default.as_str().to_string()
                } else {
                    errors.push(format!("environment variable {} is required but not defined", &caps[1]));
                    String::new()
                }
            }
        }
    });

    if errors.is_empty() {
        Ok(replaced_text)
    } else {
        Err(Error::config_invalid(errors.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_env_vars_default() {
        std::env::remove_var("DBBOUNCER_TEST_VAR_UNSET");
        let out = replace_env_vars("port: ${DBBOUNCER_TEST_VAR_UNSET:5432}").unwrap();
        assert_eq!(out, "port: 5432");
    }

    #[test]
    fn test_replace_env_vars_missing() {
        std::env::remove_var("DBBOUNCER_TEST_VAR_UNSET2");
        let err = replace_env_vars("port: ${DBBOUNCER_TEST_VAR_UNSET2}");
        assert!(err.is_err());
    }

    #[test]
    fn test_replace_env_vars_present() {
        std::env::set_var("DBBOUNCER_TEST_VAR_SET", "9999");
        let out = replace_env_vars("port: ${DBBOUNCER_TEST_VAR_SET:5432}").unwrap();
        assert_eq!(out, "port: 9999");
    }
}
