use lumabeat_common::{SourceInfo, StatusInfo};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::artwork::{percent_decode, ArtworkResolver};
use crate::config::Config;
use crate::dispatch::ColorSink;
use crate::palette::{Color, PaletteExtractor};
use crate::scheduler::{AlternationSession, SessionSettings};
use crate::sources::{MediaSource, PlaybackStatus, SourceProvider, TrackIdentity};
use crate::tempo::{map_bpm_to_cadence, CadenceParameters, TempoProbe, TempoResolver};

/// The source currently holding the light, with everything derived from its
/// track. Kept across pauses so silence never loses the palette or cursor.
struct Owner {
    id: String,
    track: TrackIdentity,
    art_ref: String,
    bpm: f32,
    palette: Vec<Color>,
    cadence: CadenceParameters,
}

/// Per-cycle arbitration: decides which source owns the light, runs the
/// artwork/palette/tempo pipeline on track changes, and swaps alternation
/// sessions atomically.
pub struct Arbiter<P, S, T>
where
    P: SourceProvider,
    S: ColorSink,
    T: TempoProbe,
{
    cfg: Config,
    provider: P,
    sink: Arc<S>,
    artwork: ArtworkResolver,
    extractor: PaletteExtractor,
    tempo: TempoResolver<T>,
    session: Option<AlternationSession>,
    owner: Option<Owner>,
    /// Last pipeline run per (source id, title); same pair is not
    /// reprocessed within the configured window.
    processed: HashMap<(String, String), Instant>,
    /// Set by an explicit pause/stop command; arbitration stops touching the
    /// session until resume or refresh.
    manual_hold: bool,
}

impl<P, S, T> Arbiter<P, S, T>
where
    P: SourceProvider,
    S: ColorSink,
    T: TempoProbe,
{
    pub fn new(
        cfg: Config,
        provider: P,
        sink: Arc<S>,
        artwork: ArtworkResolver,
        extractor: PaletteExtractor,
        tempo: TempoResolver<T>,
    ) -> Self {
        Self {
            cfg,
            provider,
            sink,
            artwork,
            extractor,
            tempo,
            session: None,
            owner: None,
            processed: HashMap::new(),
            manual_hold: false,
        }
    }

    /// One arbitration pass. Never fails: collaborator errors degrade to
    /// "nothing observed" and the next poll tries again.
    pub async fn cycle(&mut self) {
        let ids = match self.provider.list().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("source enumeration failed: {e:#}");
                return;
            }
        };

        let mut candidates: Vec<MediaSource> = Vec::new();
        let mut playing_primary = false;
        let mut owner_present = false;

        for id in &ids {
            let class = self.cfg.classify(id);
            if let Some(owner) = &self.owner {
                if !class.ignored && *id == owner.id {
                    owner_present = true;
                }
            }
            if class.ignored {
                continue;
            }
            let status = match self.provider.status(id).await {
                Ok(s) => s,
                Err(e) => {
                    debug!("status query failed for {id}: {e:#}");
                    continue;
                }
            };
            if status != PlaybackStatus::Playing {
                continue;
            }
            let meta = match self.provider.metadata(id).await {
                Ok(m) => m,
                Err(e) => {
                    debug!("metadata query failed for {id}: {e:#}");
                    continue;
                }
            };
            playing_primary |= class.primary;
            candidates.push(MediaSource {
                id: id.clone(),
                primary: class.primary,
                status,
                track: TrackIdentity::new(&meta.artist, &meta.title, &meta.track_id, &meta.track_url),
                art_ref: meta.art_url.clone(),
                track_url: meta.track_url,
            });
        }

        let winner = self.select(&candidates, playing_primary, owner_present);
        match winner {
            None => {
                // Silence. The owner keeps the lock; the session just pauses.
                if let Some(session) = &self.session {
                    session.pause();
                }
            }
            Some(winner) => {
                if self.manual_hold {
                    return;
                }
                let winner = winner.clone();
                self.advance(winner).await;
            }
        }
    }

    /// Primary sources outrank everything. Within a tier the current owner
    /// is sticky; fresh acquisitions break ties lexicographically. Without
    /// auto-switch a present owner holds the lock even while silent, unless
    /// a primary source outranks it.
    fn select<'a>(
        &self,
        candidates: &'a [MediaSource],
        playing_primary: bool,
        owner_present: bool,
    ) -> Option<&'a MediaSource> {
        if let Some(owner) = &self.owner {
            if !self.cfg.global.auto_switch && owner_present && !playing_primary {
                return candidates.iter().find(|c| c.id == owner.id);
            }
        }

        let tier: Vec<&MediaSource> = candidates
            .iter()
            .filter(|c| c.primary == playing_primary)
            .collect();
        if let Some(owner) = &self.owner {
            if let Some(own) = tier.iter().find(|c| c.id == owner.id) {
                return Some(*own);
            }
        }
        tier.into_iter().min_by(|a, b| a.id.cmp(&b.id))
    }

    /// Winner in hand: either the state we already run, or a change that
    /// needs the pipeline.
    async fn advance(&mut self, winner: MediaSource) {
        let (same_source, same_track, same_art) = match &self.owner {
            Some(o) => (
                o.id == winner.id,
                o.id == winner.id && o.track.stable_id == winner.track.stable_id,
                o.art_ref == winner.art_ref,
            ),
            None => (false, false, false),
        };

        if same_track && same_art {
            match &self.session {
                Some(session) => session.resume(),
                None => self.process(winner).await,
            }
            return;
        }

        // Suppression is keyed on (source, title) alone: players that churn
        // trackid or artUrl mid-song must not re-run the pipeline every
        // poll cycle.
        if self.session.is_some() {
            let key = (winner.id.clone(), winner.track.title.clone());
            if let Some(at) = self.processed.get(&key) {
                if at.elapsed() < self.cfg.global.reprocess_interval {
                    if let Some(session) = &self.session {
                        session.resume();
                    }
                    return;
                }
            }
        }

        if !same_source {
            info!("light lock acquired by {}", winner.id);
        }
        self.process(winner).await;
    }

    /// The full pipeline: artwork, palette, tempo, cadence, session swap.
    async fn process(&mut self, source: MediaSource) {
        info!("now playing on {}: {}", source.id, source.track.display());

        let palette = match self
            .artwork
            .resolve(
                &source.track.artist,
                &source.track.title,
                &source.track.title,
                &source.art_ref,
            )
            .await
        {
            Ok(path) => match self.extractor.extract_from_file(&path) {
                Ok(p) => p,
                Err(e) => {
                    warn!("palette extraction failed: {e:#}");
                    self.extractor.fallback()
                }
            },
            Err(e) => {
                debug!("artwork resolution failed: {e:#}");
                self.extractor.fallback()
            }
        };

        let local_file = source
            .track_url
            .strip_prefix("file://")
            .map(|s| PathBuf::from(percent_decode(s)));
        let bpm = self
            .tempo
            .resolve(&source.track.artist, &source.track.title, local_file.as_deref())
            .await;
        let cadence = map_bpm_to_cadence(&self.cfg.tempo, bpm);

        let swatch: Vec<String> = palette.iter().map(Color::hex).collect();
        info!(
            "palette [{}], {:.1}s alternation / {:.2}s transition{}",
            swatch.join(" "),
            cadence.delay_secs,
            cadence.transition_secs,
            if bpm > 0.0 {
                format!(" ({bpm:.0} bpm)")
            } else {
                " (no tempo)".to_string()
            }
        );

        if let Some(old) = self.session.take() {
            old.stop().await;
        }
        self.session = Some(AlternationSession::start(
            self.sink.clone(),
            palette.clone(),
            cadence.clone(),
            self.settings(),
            source.id.clone(),
        ));
        let window = self.cfg.global.reprocess_interval;
        self.processed.retain(|_, at| at.elapsed() < window);
        self.processed.insert(
            (source.id.clone(), source.track.title.clone()),
            Instant::now(),
        );
        self.owner = Some(Owner {
            id: source.id,
            track: source.track,
            art_ref: source.art_ref,
            bpm,
            palette,
            cadence,
        });
    }

    fn settings(&self) -> SessionSettings {
        SessionSettings {
            safe_mode: self.cfg.light.safe_mode,
            safe_pause: self.cfg.light.safe_pause,
            max_failures: self.cfg.light.max_failures,
            backoff_factor: self.cfg.light.backoff_factor,
        }
    }

    pub fn pause(&mut self) {
        self.manual_hold = true;
        if let Some(session) = &self.session {
            session.pause();
        }
    }

    pub fn resume(&mut self) {
        self.manual_hold = false;
        if let Some(session) = &self.session {
            session.resume();
        }
    }

    /// Stop alternating and drop the lock; stays stopped until resume,
    /// refresh, or a restart.
    pub async fn stop(&mut self) {
        self.manual_hold = true;
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
        self.owner = None;
    }

    /// Forget everything and re-arbitrate from scratch, bypassing the
    /// reprocess window.
    pub async fn refresh(&mut self) {
        self.manual_hold = false;
        self.processed.clear();
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
        self.owner = None;
        self.cycle().await;
    }

    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
    }

    pub fn status(&self) -> StatusInfo {
        StatusInfo {
            owning_source: self.owner.as_ref().map(|o| o.id.clone()),
            track: self.owner.as_ref().map(|o| o.track.display()),
            session_state: self
                .session
                .as_ref()
                .map(|s| s.state().as_str())
                .unwrap_or("Stopped")
                .to_string(),
            palette: self
                .owner
                .as_ref()
                .map(|o| o.palette.iter().map(Color::hex).collect())
                .unwrap_or_default(),
            bpm: self.owner.as_ref().map(|o| o.bpm).unwrap_or(0.0),
            delay_secs: self
                .owner
                .as_ref()
                .map(|o| o.cadence.delay_secs)
                .unwrap_or(0.0),
            transition_secs: self
                .owner
                .as_ref()
                .map(|o| o.cadence.transition_secs)
                .unwrap_or(0.0),
        }
    }

    /// Everything the provider can currently see, classification included.
    pub async fn sources(&self) -> Vec<SourceInfo> {
        let ids = match self.provider.list().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("source enumeration failed: {e:#}");
                return Vec::new();
            }
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let class = self.cfg.classify(&id);
            let status = self
                .provider
                .status(&id)
                .await
                .unwrap_or(PlaybackStatus::Unknown);
            let track = match self.provider.metadata(&id).await {
                Ok(meta) => {
                    let t = TrackIdentity::new(&meta.artist, &meta.title, "", "");
                    (!t.is_empty()).then(|| t.display())
                }
                Err(_) => None,
            };
            out.push(SourceInfo {
                id,
                primary: class.primary,
                status: status.as_str().to_string(),
                track,
                ignored: class.ignored,
            });
        }
        out
    }

    pub fn tempo(&self) -> &TempoResolver<T> {
        &self.tempo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TempoConfig;
    use crate::sources::SourceMetadata;
    use crate::tempo::TempoCache;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct NullSink;
    impl ColorSink for NullSink {
        async fn send(&self, _color: Color, _transition_secs: f32) -> Result<()> {
            Ok(())
        }
    }

    /// Counts pipeline runs: every process() triggers exactly one web probe
    /// because the probe answers None and misses are never cached.
    struct CountingProbe {
        web_calls: AtomicUsize,
    }

    impl TempoProbe for &CountingProbe {
        async fn file_bpm(&self, _path: &std::path::Path) -> Result<Option<f32>> {
            Ok(None)
        }
        async fn web_bpm(&self, _artist: &str, _title: &str) -> Result<Option<f32>> {
            self.web_calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[derive(Clone)]
    struct MockPlayer {
        id: &'static str,
        status: PlaybackStatus,
        artist: &'static str,
        title: &'static str,
        art_url: &'static str,
        /// Report a fresh trackid on every metadata query, like players
        /// that rewrite mpris:trackid mid-song.
        churn: bool,
    }

    struct MockProvider {
        players: Mutex<Vec<MockPlayer>>,
        serial: AtomicUsize,
    }

    impl MockProvider {
        fn set(&self, players: Vec<MockPlayer>) {
            *self.players.lock().unwrap() = players;
        }
    }

    impl SourceProvider for Arc<MockProvider> {
        async fn list(&self) -> Result<Vec<String>> {
            Ok(self
                .players
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.id.to_string())
                .collect())
        }
        async fn status(&self, id: &str) -> Result<PlaybackStatus> {
            Ok(self
                .players
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.id == id)
                .map(|p| p.status)
                .unwrap_or(PlaybackStatus::Unknown))
        }
        async fn metadata(&self, id: &str) -> Result<SourceMetadata> {
            let players = self.players.lock().unwrap();
            let p = players
                .iter()
                .find(|p| p.id == id)
                .cloned()
                .unwrap_or(MockPlayer {
                    id: "",
                    status: PlaybackStatus::Unknown,
                    artist: "",
                    title: "",
                    art_url: "",
                    churn: false,
                });
            let track_id = if p.churn {
                format!("/track/{}/{}", p.id, self.serial.fetch_add(1, Ordering::SeqCst))
            } else {
                format!("/track/{}/{}", p.id, p.title)
            };
            Ok(SourceMetadata {
                art_url: p.art_url.to_string(),
                track_url: String::new(),
                title: p.title.to_string(),
                artist: p.artist.to_string(),
                track_id,
            })
        }
    }

    fn playing(id: &'static str, artist: &'static str, title: &'static str) -> MockPlayer {
        MockPlayer {
            id,
            status: PlaybackStatus::Playing,
            artist,
            title,
            art_url: "",
            churn: false,
        }
    }

    struct Fixture {
        provider: Arc<MockProvider>,
        probe: &'static CountingProbe,
        _cache_dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                provider: Arc::new(MockProvider {
                    players: Mutex::new(Vec::new()),
                    serial: AtomicUsize::new(0),
                }),
                probe: Box::leak(Box::new(CountingProbe {
                    web_calls: AtomicUsize::new(0),
                })),
                _cache_dir: tempfile::tempdir().unwrap(),
            }
        }

        fn arbiter(
            &self,
            config: &str,
        ) -> Arbiter<Arc<MockProvider>, NullSink, &'static CountingProbe> {
            let cfg = Config::parse(config).unwrap();
            let tempo = TempoResolver::new(
                TempoCache::open(&self._cache_dir.path().join("tempo.redb")).unwrap(),
                self.probe,
                TempoConfig::default(),
            );
            Arbiter::new(
                cfg,
                self.provider.clone(),
                Arc::new(NullSink),
                ArtworkResolver::new(Vec::new(), reqwest::Client::new()).unwrap(),
                PaletteExtractor::new(Default::default()),
                tempo,
            )
        }

        fn runs(&self) -> usize {
            self.probe.web_calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_cycles_are_idempotent() {
        let fx = Fixture::new();
        fx.provider.set(vec![playing("mpd", "Orbital", "Halcyon")]);
        let mut arb = fx.arbiter("");

        arb.cycle().await;
        assert_eq!(fx.runs(), 1);
        assert_eq!(arb.status().owning_source.as_deref(), Some("mpd"));
        assert_eq!(arb.status().session_state, "Running");

        arb.cycle().await;
        arb.cycle().await;
        assert_eq!(fx.runs(), 1, "unchanged winner must not reprocess");
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn primary_outranks_and_ties_break_lexicographically() {
        let fx = Fixture::new();
        fx.provider.set(vec![
            playing("vlc", "A", "One"),
            playing("mpd", "B", "Two"),
        ]);
        let mut arb = fx.arbiter("[spotify]\nprimary = true\n");

        arb.cycle().await;
        assert_eq!(arb.status().owning_source.as_deref(), Some("mpd"));

        fx.provider.set(vec![
            playing("vlc", "A", "One"),
            playing("mpd", "B", "Two"),
            playing("spotify", "C", "Three"),
        ]);
        arb.cycle().await;
        assert_eq!(arb.status().owning_source.as_deref(), Some("spotify"));
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_sources_never_win() {
        let fx = Fixture::new();
        fx.provider
            .set(vec![playing("chromium.instance7", "A", "One")]);
        let mut arb = fx.arbiter("[\"re:chromium.*\"]\nignore = true\n");

        arb.cycle().await;
        assert!(arb.status().owning_source.is_none());
        assert_eq!(fx.runs(), 0);
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silence_pauses_and_resume_skips_pipeline() {
        let fx = Fixture::new();
        fx.provider.set(vec![playing("mpd", "Orbital", "Halcyon")]);
        let mut arb = fx.arbiter("");
        arb.cycle().await;
        assert_eq!(fx.runs(), 1);

        fx.provider.set(vec![MockPlayer {
            status: PlaybackStatus::Paused,
            ..playing("mpd", "Orbital", "Halcyon")
        }]);
        arb.cycle().await;
        assert_eq!(arb.status().session_state, "Paused");
        assert_eq!(
            arb.status().owning_source.as_deref(),
            Some("mpd"),
            "silence must not release the lock"
        );

        fx.provider.set(vec![playing("mpd", "Orbital", "Halcyon")]);
        arb.cycle().await;
        assert_eq!(arb.status().session_state, "Running");
        assert_eq!(fx.runs(), 1, "resuming the same track must not reprocess");
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn track_change_reprocesses_but_art_flapping_is_debounced() {
        let fx = Fixture::new();
        fx.provider.set(vec![playing("mpd", "Orbital", "Halcyon")]);
        let mut arb = fx.arbiter("");
        arb.cycle().await;
        assert_eq!(fx.runs(), 1);

        // Same track, new art reference, inside the reprocess window.
        fx.provider.set(vec![MockPlayer {
            art_url: "https://cdn/new.jpg",
            ..playing("mpd", "Orbital", "Halcyon")
        }]);
        arb.cycle().await;
        assert_eq!(fx.runs(), 1);

        fx.provider.set(vec![playing("mpd", "Orbital", "Belfast")]);
        arb.cycle().await;
        assert_eq!(fx.runs(), 2);
        assert_eq!(
            arb.status().track.as_deref(),
            Some("Orbital - Belfast")
        );
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn trackid_churn_does_not_thrash_pipeline() {
        let fx = Fixture::new();
        fx.provider.set(vec![MockPlayer {
            churn: true,
            ..playing("mpd", "Orbital", "Halcyon")
        }]);
        let mut arb = fx.arbiter("");

        arb.cycle().await;
        assert_eq!(fx.runs(), 1);

        // Every poll reports a new trackid for the same title; the
        // (source, title) suppression key must still hold.
        arb.cycle().await;
        arb.cycle().await;
        assert_eq!(fx.runs(), 1, "trackid churn within the window reprocessed");
        assert_eq!(arb.status().session_state, "Running");

        // Once the window expires the pair is fair game again.
        tokio::time::sleep(Duration::from_secs(301)).await;
        arb.cycle().await;
        assert_eq!(fx.runs(), 2);
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stale_suppression_entries_are_pruned() {
        let fx = Fixture::new();
        fx.provider.set(vec![playing("mpd", "A", "One")]);
        let mut arb = fx.arbiter("");
        arb.cycle().await;
        assert_eq!(arb.processed.len(), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        fx.provider.set(vec![playing("mpd", "A", "Two")]);
        arb.cycle().await;
        assert_eq!(fx.runs(), 2);
        assert_eq!(arb.processed.len(), 1, "expired entry for One still retained");
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_hold_blocks_arbitration_until_resume() {
        let fx = Fixture::new();
        fx.provider.set(vec![playing("mpd", "A", "One")]);
        let mut arb = fx.arbiter("");
        arb.cycle().await;

        arb.pause();
        assert_eq!(arb.status().session_state, "Paused");
        arb.cycle().await;
        assert_eq!(arb.status().session_state, "Paused");

        // Even a track change is held back.
        fx.provider.set(vec![playing("mpd", "A", "Two")]);
        arb.cycle().await;
        assert_eq!(fx.runs(), 1);

        arb.resume();
        arb.cycle().await;
        assert_eq!(fx.runs(), 2);
        assert_eq!(arb.status().session_state, "Running");
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_bypasses_reprocess_window() {
        let fx = Fixture::new();
        fx.provider.set(vec![playing("mpd", "A", "One")]);
        let mut arb = fx.arbiter("");
        arb.cycle().await;
        arb.cycle().await;
        assert_eq!(fx.runs(), 1);

        arb.refresh().await;
        assert_eq!(fx.runs(), 2);
        assert_eq!(arb.status().session_state, "Running");
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn without_auto_switch_silent_owner_holds_lock() {
        let fx = Fixture::new();
        fx.provider.set(vec![playing("mpd", "A", "One")]);
        let mut arb = fx.arbiter("[global]\nauto-switch = false\n");
        arb.cycle().await;
        assert_eq!(arb.status().owning_source.as_deref(), Some("mpd"));

        // Owner pauses while another source plays; the lock is held.
        fx.provider.set(vec![
            MockPlayer {
                status: PlaybackStatus::Paused,
                ..playing("mpd", "A", "One")
            },
            playing("vlc", "B", "Two"),
        ]);
        arb.cycle().await;
        assert_eq!(arb.status().owning_source.as_deref(), Some("mpd"));
        assert_eq!(arb.status().session_state, "Paused");

        // Once the owner disappears, the other source takes over.
        fx.provider.set(vec![playing("vlc", "B", "Two")]);
        arb.cycle().await;
        assert_eq!(arb.status().owning_source.as_deref(), Some("vlc"));
        arb.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn sources_listing_reports_classification() {
        let fx = Fixture::new();
        fx.provider.set(vec![
            playing("spotify", "A", "One"),
            MockPlayer {
                status: PlaybackStatus::Stopped,
                ..playing("chromium.7", "", "")
            },
        ]);
        let arb = fx.arbiter("[spotify]\nprimary = true\n[\"re:chromium.*\"]\nignore = true\n");

        let sources = arb.sources().await;
        assert_eq!(sources.len(), 2);
        let spotify = sources.iter().find(|s| s.id == "spotify").unwrap();
        assert!(spotify.primary && !spotify.ignored);
        assert_eq!(spotify.track.as_deref(), Some("A - One"));
        let chromium = sources.iter().find(|s| s.id == "chromium.7").unwrap();
        assert!(chromium.ignored);
        assert_eq!(chromium.track, None);
    }
}
