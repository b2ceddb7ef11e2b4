use anyhow::{bail, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const ENV_URL: &str = "TASKLISTS_URL";
const ENV_ANON_KEY: &str = "TASKLISTS_ANON_KEY";
const ENV_TOKEN: &str = "TASKLISTS_TOKEN";

pub const KEYS: [&str; 3] = ["url", "anon_key", "token"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Hosted platform endpoint and credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub token: Option<String>,
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "tasklists", "tasklists")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.to_path_buf())
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Environment variables win over the file
    pub fn with_env(mut self) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if let Some(url) = var(ENV_URL) {
            self.remote.url = Some(url);
        }
        if let Some(key) = var(ENV_ANON_KEY) {
            self.remote.anon_key = Some(key);
        }
        if let Some(token) = var(ENV_TOKEN) {
            self.remote.token = Some(token);
        }
        self
    }

    pub fn set(&mut self, key: &str, value: String) -> Result<()> {
        match key {
            "url" => self.remote.url = Some(value.trim_end_matches('/').to_string()),
            "anon_key" => self.remote.anon_key = Some(value),
            "token" => self.remote.token = Some(value),
            _ => bail!(
                "Unknown config key: {}. Valid keys: {}",
                key,
                KEYS.join(", ")
            ),
        }
        Ok(())
    }

    /// Value for display; secrets are masked
    pub fn get(&self, key: &str) -> Result<String> {
        let masked = |v: &Option<String>| v.as_ref().map(|_| "****").unwrap_or_default().to_string();
        Ok(match key {
            "url" => self.remote.url.clone().unwrap_or_default(),
            "anon_key" => masked(&self.remote.anon_key),
            "token" => masked(&self.remote.token),
            _ => bail!("Unknown config key: {}", key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_file() {
        let config: Config = toml::from_str(
            r#"
            [remote]
            url = "https://abc.supabase.co"
            anon_key = "public-key"
            "#,
        )
        .unwrap();
        assert_eq!(config.remote.url.as_deref(), Some("https://abc.supabase.co"));
        assert_eq!(config.remote.token, None);
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.remote, RemoteConfig::default());
    }

    #[test]
    fn test_set_and_get() {
        let mut config = Config::default();
        config.set("url", "https://abc.supabase.co/".to_string()).unwrap();
        config.set("token", "secret".to_string()).unwrap();

        assert_eq!(config.get("url").unwrap(), "https://abc.supabase.co");
        assert_eq!(config.get("token").unwrap(), "****");
        assert_eq!(config.get("anon_key").unwrap(), "");
        assert!(config.set("server", "x".to_string()).is_err());
        assert!(config.get("server").is_err());
    }
}
