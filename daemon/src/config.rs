//! INI configuration file.
//!
//! Sections: `Platform {url}`, `Provider {host, android-port, apple-port}`,
//! `StartParam {enable-android, enable-apple, wda-bundle-id, owner, project}`.
//! A missing file or malformed value is fatal.

use std::path::Path;

use anyhow::{Context, Result};
use ini::Ini;

#[derive(Debug, Clone)]
pub struct Config {
    pub platform_url: String,
    pub host: String,
    pub android_port: u16,
    pub apple_port: u16,
    pub enable_android: bool,
    pub enable_apple: bool,
    pub wda_bundle_id: String,
    pub owner: String,
    pub project: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_ini_str(&content)
    }

    pub fn from_ini_str(content: &str) -> Result<Self> {
        let ini = Ini::load_from_str(content).context("parsing config file")?;
        let get = |section: &str, key: &str| -> Result<String> {
            ini.section(Some(section))
                .and_then(|s| s.get(key))
                .map(str::to_string)
                .with_context(|| format!("missing [{section}] {key}"))
        };

        Ok(Self {
            platform_url: get("Platform", "url")?,
            host: get("Provider", "host")?,
            android_port: get("Provider", "android-port")?
                .parse()
                .context("bad [Provider] android-port")?,
            apple_port: get("Provider", "apple-port")?
                .parse()
                .context("bad [Provider] apple-port")?,
            enable_android: parse_bool(&get("StartParam", "enable-android")?),
            enable_apple: parse_bool(&get("StartParam", "enable-apple")?),
            wda_bundle_id: get("StartParam", "wda-bundle-id")?,
            owner: get("StartParam", "owner")?,
            project: get("StartParam", "project")?,
        })
    }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
[Platform]
url = http://platform.example:8000

[Provider]
host = 10.0.0.2
android-port = 3500
apple-port = 3600

[StartParam]
enable-android = TRUE
enable-apple = false
wda-bundle-id = com.example.WebDriverAgentRunner
owner = qa@example.com
project = demo
";

    #[test]
    fn parses_all_sections() {
        let config = Config::from_ini_str(SAMPLE).unwrap();
        assert_eq!(config.platform_url, "http://platform.example:8000");
        assert_eq!(config.host, "10.0.0.2");
        assert_eq!(config.android_port, 3500);
        assert_eq!(config.apple_port, 3600);
        assert!(config.enable_android); // booleans are case-insensitive
        assert!(!config.enable_apple);
        assert_eq!(config.owner, "qa@example.com");
        assert_eq!(config.project, "demo");
    }

    #[test]
    fn missing_key_is_an_error() {
        let err = Config::from_ini_str("[Platform]\nurl = x\n").unwrap_err();
        assert!(err.to_string().contains("[Provider] host"));
    }
}
