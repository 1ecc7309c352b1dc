use super::AppConfig;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tokio::fs::{create_dir_all, read_to_string, try_exists, write};
use tracing::{debug, info, warn};

const APP_DIR: &str = "luxbridge";
const CONFIG_FILE: &str = "config.toml";

/// `<config dir>/luxbridge/config.toml`, relative to the working directory if the
/// platform has no config dir
pub fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    path.push(APP_DIR);
    path.push(CONFIG_FILE);
    path
}

pub async fn save_config(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !try_exists(parent)
            .await
            .map_err(|e| eyre!("Failed to check if config directory exists: {}", e))?
        {
            create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| eyre!("Failed to serialize config: {}", e))?;

    write(path, content)
        .await
        .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;

    debug!("Saved config to {}", path.display());
    Ok(())
}

/// Reads the settings file, generating and persisting a client id if it has none
pub async fn load_config(path: &Path) -> Result<AppConfig> {
    let content = read_to_string(path)
        .await
        .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let mut config: AppConfig = toml::from_str(&content)
        .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    if config.ensure_client_id() {
        info!("Generated client id {}", config.broker.client_id);
        save_config(path, &config).await?;
    }

    Ok(config)
}

/// Writes a default settings file if none exists; returns whether one was created
pub async fn ensure_default_config(path: &Path) -> Result<bool> {
    if try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
    {
        return Ok(false);
    }

    info!("Creating default configuration at {}", path.display());
    let mut config = AppConfig::default();
    config.ensure_client_id();
    save_config(path, &config).await?;
    Ok(true)
}

pub async fn load_or_create(path: &Path) -> Result<AppConfig> {
    if ensure_default_config(path).await? {
        warn!(
            "Broker settings are empty, fill in {} before switching the bridge on",
            path.display()
        );
    }
    load_config(path).await
}

#[cfg(test)]
mod tests {
    use super::super::TransportKind;
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("luxbridge-test-{}-{}", std::process::id(), name))
            .join(CONFIG_FILE)
    }

    #[tokio::test]
    async fn creates_default_file_once() {
        let path = temp_path("default");

        let config = load_or_create(&path).await.unwrap();
        assert!(path.exists());
        assert!(config.broker.server_uri.is_empty());
        assert!(config.broker.client_id.starts_with("luxbridge-"));

        // Second load keeps the generated id
        assert!(!ensure_default_config(&path).await.unwrap());
        let reloaded = load_config(&path).await.unwrap();
        assert_eq!(reloaded.broker.client_id, config.broker.client_id);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn persists_generated_client_id() {
        let path = temp_path("client-id");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "transport = \"simulated\"\n\n[broker]\nserver_uri = \"tcp://localhost\"\n",
        )
        .unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.transport, TransportKind::Simulated);
        assert!(!config.broker.client_id.is_empty());

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains(&config.broker.client_id));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn invalid_file_is_an_error() {
        let path = temp_path("invalid");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "transport = \"carrier-pigeon\"\n").unwrap();

        assert!(load_config(&path).await.is_err());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
