use anyhow::{Context, Result};
use std::future::Future;
use std::process::Stdio;
use tokio::process::Command;

/// Field separator used in the playerctl metadata template. Unit separator
/// never shows up in tag data.
const SEP: char = '\u{1f}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Stopped,
    Unknown,
}

impl PlaybackStatus {
    /// Collaborator output is free text; anything unrecognized is Unknown.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "Playing" => Self::Playing,
            "Paused" => Self::Paused,
            "Stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Playing => "Playing",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackIdentity {
    pub artist: String,
    pub title: String,
    /// Provider track id, or the track URL surrogate when the provider id
    /// is unusable.
    pub stable_id: String,
}

impl TrackIdentity {
    pub fn new(artist: &str, title: &str, track_id: &str, track_url: &str) -> Self {
        // MPRIS players without a real id report the NoTrack sentinel.
        let unusable = track_id.is_empty() || track_id.contains("NoTrack");
        let stable_id = if unusable {
            track_url.to_string()
        } else {
            track_id.to_string()
        };
        Self {
            artist: artist.to_string(),
            title: title.to_string(),
            stable_id,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.artist.is_empty() && self.title.is_empty()
    }

    pub fn display(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

/// Raw per-player metadata as reported by the collaborator. Partial results
/// (empty fields) are valid.
#[derive(Debug, Clone, Default)]
pub struct SourceMetadata {
    pub art_url: String,
    pub track_url: String,
    pub title: String,
    pub artist: String,
    pub track_id: String,
}

/// One candidate source as observed in a single poll cycle.
#[derive(Debug, Clone)]
pub struct MediaSource {
    pub id: String,
    pub primary: bool,
    pub status: PlaybackStatus,
    pub track: TrackIdentity,
    /// Artwork reference for change detection (URL or local path).
    pub art_ref: String,
    pub track_url: String,
}

/// Media player enumeration/metadata collaborator. Treated as slow and
/// fallible; an empty list is a valid answer.
pub trait SourceProvider: Send + Sync {
    fn list(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
    fn status(&self, id: &str) -> impl Future<Output = Result<PlaybackStatus>> + Send;
    fn metadata(&self, id: &str) -> impl Future<Output = Result<SourceMetadata>> + Send;
}

/// Production provider shelling out to playerctl.
pub struct PlayerctlProvider;

impl PlayerctlProvider {
    async fn run(args: &[&str]) -> Result<String> {
        let output = Command::new("playerctl")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to invoke playerctl")?;
        // playerctl exits non-zero when no players are present; treat that
        // as an empty answer rather than an error.
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}

impl SourceProvider for PlayerctlProvider {
    async fn list(&self) -> Result<Vec<String>> {
        let out = Self::run(&["-l"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn status(&self, id: &str) -> Result<PlaybackStatus> {
        let out = Self::run(&["-p", id, "status"]).await?;
        Ok(PlaybackStatus::parse(&out))
    }

    async fn metadata(&self, id: &str) -> Result<SourceMetadata> {
        let format = format!(
            "{{{{mpris:artUrl}}}}{SEP}{{{{xesam:url}}}}{SEP}{{{{title}}}}{SEP}{{{{artist}}}}{SEP}{{{{mpris:trackid}}}}"
        );
        let out = Self::run(&["-p", id, "metadata", "--format", &format]).await?;
        let mut fields = out.split(SEP).map(|s| s.trim().to_string());
        Ok(SourceMetadata {
            art_url: fields.next().unwrap_or_default(),
            track_url: fields.next().unwrap_or_default(),
            title: fields.next().unwrap_or_default(),
            artist: fields.next().unwrap_or_default(),
            track_id: fields.next().unwrap_or_default(),
        })
    }
}
