use serde::{Deserialize, Serialize};

/// Requests accepted by the daemon on its unix socket. One JSON-encoded
/// request per connection, answered with a single [`Response`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "refresh")]
    Refresh,
    #[serde(rename = "sources")]
    Sources,
    #[serde(rename = "tempo")]
    Tempo(TempoCommand),
    #[serde(rename = "kill")]
    Kill,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", content = "params")]
pub enum TempoCommand {
    #[serde(rename = "get")]
    Get { artist: String, title: String },
    #[serde(rename = "forget")]
    Forget { artist: String, title: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    Status(StatusInfo),
    Sources(Vec<SourceInfo>),
    Tempo(Option<f32>),
}

/// Snapshot of the daemon's current state, for `lmbctl status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusInfo {
    pub owning_source: Option<String>,
    pub track: Option<String>,
    pub session_state: String,
    pub palette: Vec<String>,
    pub bpm: f32,
    pub delay_secs: f32,
    pub transition_secs: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: String,
    pub primary: bool,
    pub status: String,
    pub track: Option<String>,
    pub ignored: bool,
}
