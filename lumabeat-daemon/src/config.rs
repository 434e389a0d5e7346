use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::palette::PaletteConfig;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub light: LightConfig,
    #[serde(default)]
    pub tempo: TempoConfig,
    #[serde(default)]
    pub palette: PaletteConfig,
    #[serde(flatten)]
    pub players: HashMap<String, PlayerOverride>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GlobalConfig {
    /// How often the arbitrator polls the media sources.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Minimum interval before the same (source, title) pair is reprocessed.
    #[serde(with = "humantime_serde", default = "default_reprocess_interval")]
    pub reprocess_interval: Duration,
    /// Release the lock when another non-primary source starts playing.
    #[serde(default = "default_true")]
    pub auto_switch: bool,
    /// Directories searched for local artwork files.
    #[serde(default)]
    pub artwork_dirs: Vec<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            reprocess_interval: default_reprocess_interval(),
            auto_switch: true,
            artwork_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LightConfig {
    /// Lighting webhook endpoint. The only required setting.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Extra pause between dispatches when enabled, to spare cheap bridges.
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(with = "humantime_serde", default = "default_safe_pause")]
    pub safe_pause: Duration,
    /// Consecutive dispatch failures before the delay is backed off.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f32,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            request_timeout: default_request_timeout(),
            safe_mode: false,
            safe_pause: default_safe_pause(),
            max_failures: default_max_failures(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TempoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bpm_min")]
    pub bpm_min: f32,
    #[serde(default = "default_bpm_max")]
    pub bpm_max: f32,
    /// Alternation delay bounds (seconds); fast tracks get the short end.
    #[serde(default = "default_min_delay")]
    pub min_delay: f32,
    #[serde(default = "default_max_delay")]
    pub max_delay: f32,
    #[serde(default = "default_min_transition")]
    pub min_transition: f32,
    #[serde(default = "default_max_transition")]
    pub max_transition: f32,
    /// Hardware-safe transition floor; shorter values are remapped, not clamped.
    #[serde(default = "default_transition_floor")]
    pub transition_floor: f32,
    #[serde(default = "default_default_delay")]
    pub default_delay: f32,
    #[serde(default = "default_default_transition")]
    pub default_transition: f32,
    /// External estimator invoked with a file path when tags carry no BPM.
    pub analyzer_command: Option<String>,
    /// Override for the tempo cache location.
    pub cache_path: Option<PathBuf>,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bpm_min: default_bpm_min(),
            bpm_max: default_bpm_max(),
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
            min_transition: default_min_transition(),
            max_transition: default_max_transition(),
            transition_floor: default_transition_floor(),
            default_delay: default_default_delay(),
            default_transition: default_default_transition(),
            analyzer_command: None,
            cache_path: None,
        }
    }
}

/// Per-player section. The section name is a player id or an `re:`-prefixed
/// regex matched against player ids.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PlayerOverride {
    pub primary: Option<bool>,
    pub ignore: Option<bool>,
}

impl PlayerOverride {
    fn merge(&mut self, other: &Self) {
        if other.primary.is_some() {
            self.primary = other.primary;
        }
        if other.ignore.is_some() {
            self.ignore = other.ignore;
        }
    }
}

/// Arbitration classification resolved from the player sections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceClass {
    pub primary: bool,
    pub ignored: bool,
}

impl Config {
    pub async fn load() -> Result<Self> {
        let config_path = Self::path()?;

        if !config_path.exists() {
            anyhow::bail!(
                "no config file at {} (light.webhook-url is required)",
                config_path.display()
            );
        }

        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file {}", config_path.display()))?;
        let config = Self::parse(&content)?;
        config.validate()?;

        tracing::info!(
            "Loaded config with {} player override section(s)",
            config.players.len()
        );
        Ok(config)
    }

    pub fn path() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("failed to determine config directory")?
            .join("lumabeat")
            .join("config.toml"))
    }

    /// Parse as a raw TOML table first so per-player sections can be
    /// collected without fighting serde(flatten).
    pub fn parse(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content).context("failed to parse config TOML")?;

        fn section<T: Default + serde::de::DeserializeOwned>(
            table: &toml::Table,
            name: &str,
        ) -> Result<T> {
            match table.get(name) {
                Some(v) => v
                    .clone()
                    .try_into()
                    .with_context(|| format!("invalid [{name}] config section")),
                None => Ok(T::default()),
            }
        }

        let global: GlobalConfig = section(&table, "global")?;
        let light: LightConfig = section(&table, "light")?;
        let tempo: TempoConfig = section(&table, "tempo")?;
        let palette: PaletteConfig = section(&table, "palette")?;

        let mut players = HashMap::new();
        for (key, value) in &table {
            if matches!(key.as_str(), "global" | "light" | "tempo" | "palette") {
                continue;
            }
            match value.clone().try_into::<PlayerOverride>() {
                Ok(cfg) => {
                    players.insert(key.clone(), cfg);
                }
                Err(e) => {
                    tracing::error!("Skipping player config section [{}]: {}", key, e);
                }
            }
        }

        Ok(Config {
            global,
            light,
            tempo,
            palette,
            players,
        })
    }

    /// Startup-fatal validation. Runtime faults never come through here.
    pub fn validate(&self) -> Result<()> {
        if self.light.webhook_url.is_empty() {
            anyhow::bail!("light.webhook-url is not set");
        }
        if self.tempo.bpm_min >= self.tempo.bpm_max {
            anyhow::bail!("tempo.bpm-min must be below tempo.bpm-max");
        }
        if self.tempo.min_delay > self.tempo.max_delay {
            anyhow::bail!("tempo.min-delay must not exceed tempo.max-delay");
        }
        if self.palette.size == 0 {
            anyhow::bail!("palette.size must be at least 1");
        }
        Ok(())
    }

    /// Classify a player id against the override sections. Literal names
    /// win over `re:` patterns; later regex sections merge over earlier ones.
    pub fn classify(&self, id: &str) -> SourceClass {
        let mut resolved = PlayerOverride::default();

        for (key, val) in &self.players {
            if let Some(pattern) = key.strip_prefix("re:") {
                if let Ok(re) = Regex::new(pattern) {
                    if re.is_match(id) {
                        resolved.merge(val);
                    }
                }
            }
        }
        if let Some(val) = self.players.get(id) {
            resolved.merge(val);
        }

        SourceClass {
            primary: resolved.primary.unwrap_or(false),
            ignored: resolved.ignore.unwrap_or(false),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(3)
}
fn default_reprocess_interval() -> Duration {
    Duration::from_secs(300)
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_safe_pause() -> Duration {
    Duration::from_millis(150)
}
fn default_max_failures() -> u32 {
    3
}
fn default_backoff_factor() -> f32 {
    1.5
}
fn default_bpm_min() -> f32 {
    40.0
}
fn default_bpm_max() -> f32 {
    180.0
}
fn default_min_delay() -> f32 {
    2.0
}
fn default_max_delay() -> f32 {
    10.0
}
fn default_min_transition() -> f32 {
    0.3
}
fn default_max_transition() -> f32 {
    3.0
}
fn default_transition_floor() -> f32 {
    0.5
}
fn default_default_delay() -> f32 {
    5.0
}
fn default_default_transition() -> f32 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let cfg = Config::parse(
            r#"
            [global]
            poll-interval = "5s"
            auto-switch = false
            artwork-dirs = ["/music/covers"]

            [light]
            webhook-url = "http://bridge.local/api/lights"
            safe-mode = true

            [tempo]
            bpm-max = 200.0

            [palette]
            size = 4

            [spotify]
            primary = true

            ["re:chromium.*"]
            ignore = true
            "#,
        )
        .unwrap();

        cfg.validate().unwrap();
        assert_eq!(cfg.global.poll_interval, Duration::from_secs(5));
        assert!(!cfg.global.auto_switch);
        assert_eq!(cfg.tempo.bpm_max, 200.0);
        assert_eq!(cfg.palette.size, 4);
        assert!(cfg.light.safe_mode);

        assert_eq!(
            cfg.classify("spotify"),
            SourceClass {
                primary: true,
                ignored: false
            }
        );
        assert_eq!(
            cfg.classify("chromium.instance42"),
            SourceClass {
                primary: false,
                ignored: true
            }
        );
        assert_eq!(cfg.classify("vlc"), SourceClass::default());
    }

    #[test]
    fn missing_webhook_url_is_fatal() {
        let cfg = Config::parse("[global]\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn literal_section_wins_over_regex() {
        let cfg = Config::parse(
            r#"
            [light]
            webhook-url = "http://x"

            ["re:.*"]
            ignore = true

            [mpd]
            ignore = false
            "#,
        )
        .unwrap();
        assert!(!cfg.classify("mpd").ignored);
        assert!(cfg.classify("vlc").ignored);
    }
}
