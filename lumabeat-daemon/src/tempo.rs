use anyhow::{Context, Result};
use lofty::file::TaggedFileExt;
use lofty::probe::Probe;
use lofty::tag::ItemKey;
use redb::{Database, TableDefinition};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::Path;
use tracing::{debug, warn};

use crate::config::TempoConfig;

const TEMPO_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tempo");

/// Plausibility window for web lookup results.
const WEB_BPM_MIN: f32 = 40.0;
const WEB_BPM_MAX: f32 = 220.0;

/// Alternation cadence derived from a track's tempo.
#[derive(Debug, Clone, PartialEq)]
pub struct CadenceParameters {
    pub delay_secs: f32,
    pub transition_secs: f32,
}

/// Higher tempo, shorter delay. The transition shares the mapping but is
/// floored at a hardware-safe minimum; sub-floor values are remapped into
/// [floor/2, floor] so very fast tracks keep their relative ordering
/// instead of collapsing onto the floor.
pub fn map_bpm_to_cadence(cfg: &TempoConfig, bpm: f32) -> CadenceParameters {
    if bpm <= 0.0 {
        return CadenceParameters {
            delay_secs: cfg.default_delay,
            transition_secs: cfg.default_transition,
        };
    }

    let clamped = bpm.clamp(cfg.bpm_min, cfg.bpm_max);
    let p = (clamped - cfg.bpm_min) / (cfg.bpm_max - cfg.bpm_min);

    let delay = cfg.max_delay - p * (cfg.max_delay - cfg.min_delay);

    let raw = cfg.max_transition - p * (cfg.max_transition - cfg.min_transition);
    let floor = cfg.transition_floor;
    let transition = if raw >= floor || cfg.min_transition >= floor {
        raw
    } else {
        let half = floor / 2.0;
        half + (raw - cfg.min_transition) / (floor - cfg.min_transition) * (floor - half)
    };

    CadenceParameters {
        delay_secs: delay,
        transition_secs: transition,
    }
}

/// One cached tempo. Entries never expire; `lmbctl tempo forget` is the
/// only eviction path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempoCacheEntry {
    pub artist: String,
    pub title: String,
    pub bpm: f32,
    pub source: String,
    pub cached_at: i64,
}

pub struct TempoCache {
    db: Database,
}

impl TempoCache {
    pub fn open_default() -> Result<Self> {
        let path = dirs::cache_dir()
            .context("failed to determine cache directory")?
            .join("lumabeat")
            .join("tempo.redb");
        Self::open(&path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open tempo cache {}", path.display()))?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TEMPO_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Stable across runs and platforms: sha256 over the normalized pair.
    fn key(artist: &str, title: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(artist.to_lowercase().as_bytes());
        hasher.update([0x1f]);
        hasher.update(title.to_lowercase().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, artist: &str, title: &str) -> Result<Option<TempoCacheEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TEMPO_TABLE)?;
        if let Some(data) = table.get(Self::key(artist, title).as_str())? {
            let entry: TempoCacheEntry = bincode::deserialize(data.value())?;
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    pub fn put(&self, entry: &TempoCacheEntry) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TEMPO_TABLE)?;
            let data = bincode::serialize(entry)?;
            table.insert(
                Self::key(&entry.artist, &entry.title).as_str(),
                data.as_slice(),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn forget(&self, artist: &str, title: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(TEMPO_TABLE)?;
            let removed = table.remove(Self::key(artist, title).as_str())?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

/// Tempo lookup collaborators: embedded tags / external estimator for local
/// files, remote services for everything else.
pub trait TempoProbe: Send + Sync {
    fn file_bpm(&self, path: &Path) -> impl Future<Output = Result<Option<f32>>> + Send;
    fn web_bpm(&self, artist: &str, title: &str)
        -> impl Future<Output = Result<Option<f32>>> + Send;
}

/// Production probe: lofty tag read, then the configured analyzer command,
/// then tunebat/songbpm (the services the original lookup tool used).
pub struct DefaultProbe {
    client: reqwest::Client,
    analyzer_command: Option<String>,
}

impl DefaultProbe {
    pub fn new(client: reqwest::Client, analyzer_command: Option<String>) -> Self {
        Self {
            client,
            analyzer_command,
        }
    }

    async fn tag_bpm(path: &Path) -> Result<Option<f32>> {
        let path = path.to_path_buf();
        let bpm = tokio::task::spawn_blocking(move || -> Result<Option<f32>> {
            let tagged = Probe::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?
                .read()
                .with_context(|| format!("failed to read tags from {}", path.display()))?;
            for tag in tagged.tags() {
                if let Some(s) = tag.get_string(&ItemKey::Bpm) {
                    if let Some(bpm) = parse_bpm(s) {
                        return Ok(Some(bpm));
                    }
                }
            }
            Ok(None)
        })
        .await
        .context("tag reader task panicked")??;
        Ok(bpm)
    }

    async fn analyzer_bpm(&self, path: &Path) -> Result<Option<f32>> {
        let Some(cmd) = &self.analyzer_command else {
            return Ok(None);
        };
        let mut parts = cmd.split_whitespace();
        let Some(program) = parts.next() else {
            return Ok(None);
        };
        let output = tokio::process::Command::new(program)
            .args(parts)
            .arg(path)
            .output()
            .await
            .with_context(|| format!("failed to run analyzer {program}"))?;
        if !output.status.success() {
            anyhow::bail!("analyzer {program} exited with {}", output.status);
        }
        Ok(parse_bpm(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn tunebat(&self, artist: &str, title: &str) -> Result<Option<f32>> {
        let body: serde_json::Value = self
            .client
            .get("https://api.tunebat.com/api/tracks/search")
            .query(&[("term", format!("{artist} {title}"))])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let Some(items) = body["data"]["items"].as_array() else {
            return Ok(None);
        };
        if items.is_empty() {
            return Ok(None);
        }

        // First result unless an exact artist+title match exists further in.
        let exact = items.iter().find(|item| {
            let title_matches = item["n"]
                .as_str()
                .map(|n| n.eq_ignore_ascii_case(title))
                .unwrap_or(false);
            let artist_matches = item["as"]
                .as_array()
                .map(|artists| {
                    artists
                        .iter()
                        .filter_map(|a| a.as_str())
                        .any(|a| a.eq_ignore_ascii_case(artist))
                })
                .unwrap_or(false);
            title_matches && artist_matches
        });
        let best = exact.unwrap_or(&items[0]);

        let bpm = match &best["b"] {
            serde_json::Value::Number(n) => n.as_f64().map(|v| v as f32),
            serde_json::Value::String(s) => parse_bpm(s),
            _ => None,
        };
        Ok(bpm.filter(|b| (WEB_BPM_MIN..=WEB_BPM_MAX).contains(b)))
    }

    async fn songbpm(&self, artist: &str, title: &str) -> Result<Option<f32>> {
        let dash = |s: &str| s.to_lowercase().replace(' ', "-");
        let plus = |s: &str| s.to_lowercase().replace(' ', "+");
        let urls = [
            format!("https://songbpm.com/@{}/{}", dash(artist), dash(title)),
            format!("https://songbpm.com/{}/{}", plus(artist), plus(title)),
        ];
        let Ok(pattern) = Regex::new(r"(?i)(\d+)\s*BPM") else {
            return Ok(None);
        };

        for url in urls {
            let response = match self.client.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    debug!("songbpm request failed for {url}: {e}");
                    continue;
                }
            };
            if !response.status().is_success() {
                continue;
            }
            let body = response.text().await.unwrap_or_default();
            if let Some(cap) = pattern.captures(&body) {
                if let Some(bpm) = parse_bpm(&cap[1]) {
                    if (WEB_BPM_MIN..=WEB_BPM_MAX).contains(&bpm) {
                        return Ok(Some(bpm));
                    }
                }
            }
        }
        Ok(None)
    }
}

impl TempoProbe for DefaultProbe {
    async fn file_bpm(&self, path: &Path) -> Result<Option<f32>> {
        match Self::tag_bpm(path).await {
            Ok(Some(bpm)) => return Ok(Some(bpm)),
            Ok(None) => {}
            Err(e) => debug!("tag read failed: {e:#}"),
        }
        self.analyzer_bpm(path).await
    }

    async fn web_bpm(&self, artist: &str, title: &str) -> Result<Option<f32>> {
        match self.tunebat(artist, title).await {
            Ok(Some(bpm)) => return Ok(Some(bpm)),
            Ok(None) => {}
            Err(e) => debug!("tunebat lookup failed: {e:#}"),
        }
        self.songbpm(artist, title).await
    }
}

/// Typed parse-with-fallback for anything claiming to be a BPM.
pub fn parse_bpm(s: &str) -> Option<f32> {
    let v = s.trim().parse::<f32>().ok()?;
    if v.is_finite() && v > 0.0 && v < 400.0 {
        Some(v)
    } else {
        None
    }
}

pub struct TempoResolver<P: TempoProbe> {
    cache: TempoCache,
    probe: P,
    cfg: TempoConfig,
}

impl<P: TempoProbe> TempoResolver<P> {
    pub fn new(cache: TempoCache, probe: P, cfg: TempoConfig) -> Self {
        Self { cache, probe, cfg }
    }

    /// Resolve a track's BPM; 0 means unknown, callers fall back to the
    /// configured default cadence. Never fails: every miss degrades.
    pub async fn resolve(&self, artist: &str, title: &str, local_file: Option<&Path>) -> f32 {
        if !self.cfg.enabled || (artist.is_empty() && title.is_empty()) {
            return 0.0;
        }

        match self.cache.get(artist, title) {
            Ok(Some(entry)) => {
                debug!("tempo cache hit: {} - {} = {} bpm", artist, title, entry.bpm);
                return entry.bpm;
            }
            Ok(None) => {}
            Err(e) => warn!("tempo cache read failed: {e:#}"),
        }

        let mut found: Option<(f32, &str)> = None;
        if let Some(path) = local_file {
            match self.probe.file_bpm(path).await {
                Ok(Some(bpm)) => found = Some((bpm, "file")),
                Ok(None) => {}
                Err(e) => debug!("file tempo probe failed: {e:#}"),
            }
        }
        if found.is_none() {
            match self.probe.web_bpm(artist, title).await {
                Ok(Some(bpm)) => found = Some((bpm, "web")),
                Ok(None) => {}
                Err(e) => debug!("web tempo probe failed: {e:#}"),
            }
        }

        match found {
            Some((bpm, source)) if bpm > 0.0 => {
                let entry = TempoCacheEntry {
                    artist: artist.to_string(),
                    title: title.to_string(),
                    bpm,
                    source: source.to_string(),
                    cached_at: chrono::Utc::now().timestamp(),
                };
                if let Err(e) = self.cache.put(&entry) {
                    warn!("tempo cache write failed: {e:#}");
                }
                bpm
            }
            _ => 0.0,
        }
    }

    pub fn cached(&self, artist: &str, title: &str) -> Option<f32> {
        self.cache.get(artist, title).ok().flatten().map(|e| e.bpm)
    }

    pub fn forget(&self, artist: &str, title: &str) -> Result<bool> {
        self.cache.forget(artist, title)
    }
}
