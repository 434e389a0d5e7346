use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dispatch::ColorSink;
use crate::palette::Color;
use crate::tempo::CadenceParameters;

/// How often a paused session re-checks its control signal.
const PAUSE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Paused,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
        }
    }
}

/// Dispatch-loop knobs taken from the light config.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub safe_mode: bool,
    pub safe_pause: Duration,
    pub max_failures: u32,
    pub backoff_factor: f32,
}

/// One run of the alternation scheduler: a background task cycling the
/// palette at the cadence, controlled through a watch channel. The cursor
/// lives inside the task; pausing never resets it.
pub struct AlternationSession {
    source_id: String,
    control: watch::Sender<SessionState>,
    handle: JoinHandle<()>,
}

impl AlternationSession {
    pub fn start<S: ColorSink>(
        sink: Arc<S>,
        palette: Vec<Color>,
        cadence: CadenceParameters,
        settings: SessionSettings,
        source_id: String,
    ) -> Self {
        let (control, rx) = watch::channel(SessionState::Running);
        let handle = tokio::spawn(run_loop(sink, palette, cadence, settings, rx));
        Self {
            source_id,
            control,
            handle,
        }
    }

    pub fn pause(&self) {
        if *self.control.borrow() == SessionState::Running {
            let _ = self.control.send(SessionState::Paused);
            debug!("session for {} paused", self.source_id);
        }
    }

    pub fn resume(&self) {
        if *self.control.borrow() == SessionState::Paused {
            let _ = self.control.send(SessionState::Running);
            debug!("session for {} resumed", self.source_id);
        }
    }

    /// Signal stop and wait for the task to actually finish, so a successor
    /// session can never dispatch concurrently with this one.
    pub async fn stop(self) {
        let _ = self.control.send(SessionState::Stopped);
        let _ = self.handle.await;
    }

    pub fn state(&self) -> SessionState {
        *self.control.borrow()
    }
}

async fn run_loop<S: ColorSink>(
    sink: Arc<S>,
    palette: Vec<Color>,
    cadence: CadenceParameters,
    settings: SessionSettings,
    mut rx: watch::Receiver<SessionState>,
) {
    if palette.is_empty() {
        return;
    }

    let mut cursor = 0usize;
    let mut last_emitted: Option<Color> = None;
    let mut delay = Duration::from_secs_f32(cadence.delay_secs.max(0.05));
    let mut failures = 0u32;

    loop {
        let state = *rx.borrow();
        match state {
            SessionState::Stopped => break,
            SessionState::Paused => {
                tokio::select! {
                    _ = tokio::time::sleep(PAUSE_POLL) => {}
                    _ = rx.changed() => {}
                }
                continue;
            }
            SessionState::Running => {}
        }

        let color = palette[cursor];
        if last_emitted != Some(color) {
            match sink.send(color, cadence.transition_secs).await {
                Ok(()) => {
                    last_emitted = Some(color);
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    warn!("light dispatch failed ({failures} consecutive): {e:#}");
                    if failures >= settings.max_failures {
                        delay = delay.mul_f32(settings.backoff_factor);
                        failures = 0;
                        warn!("backing off, alternation delay now {:.1}s", delay.as_secs_f32());
                    }
                }
            }
        }
        cursor = (cursor + 1) % palette.len();

        if settings.safe_mode {
            tokio::time::sleep(settings.safe_pause).await;
        }

        // Sleep the alternation delay, waking early for control changes so
        // pause/stop latency stays bounded by the channel, not the delay.
        let deadline = Instant::now() + delay;
        loop {
            if *rx.borrow() != SessionState::Running {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                res = rx.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct RecordingSink {
        emitted: Mutex<Vec<Color>>,
        notify: mpsc::UnboundedSender<Color>,
        fail: bool,
    }

    impl RecordingSink {
        fn new(fail: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Color>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    emitted: Mutex::new(Vec::new()),
                    notify: tx,
                    fail,
                }),
                rx,
            )
        }
    }

    impl ColorSink for RecordingSink {
        async fn send(&self, color: Color, _transition_secs: f32) -> Result<()> {
            self.emitted.lock().unwrap().push(color);
            let _ = self.notify.send(color);
            if self.fail {
                anyhow::bail!("sink down");
            }
            Ok(())
        }
    }

    fn palette() -> Vec<Color> {
        vec![
            Color::new(255, 0, 0),
            Color::new(0, 255, 0),
            Color::new(0, 0, 255),
        ]
    }

    fn cadence() -> CadenceParameters {
        CadenceParameters {
            delay_secs: 1.0,
            transition_secs: 0.5,
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            safe_mode: false,
            safe_pause: Duration::from_millis(150),
            max_failures: 3,
            backoff_factor: 1.5,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_palette_in_cyclic_order() {
        let (sink, mut rx) = RecordingSink::new(false);
        let session = AlternationSession::start(
            sink.clone(),
            palette(),
            cadence(),
            settings(),
            "spotify".into(),
        );

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        session.stop().await;

        let p = palette();
        for (i, c) in seen.iter().enumerate() {
            assert_eq!(*c, p[i % p.len()]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_terminates_task_before_returning() {
        let (sink, mut rx) = RecordingSink::new(false);
        let session = AlternationSession::start(
            sink.clone(),
            palette(),
            cadence(),
            settings(),
            "mpd".into(),
        );
        rx.recv().await.unwrap();
        session.stop().await;

        // Drain anything emitted before the stop landed; afterwards the
        // channel must stay silent.
        while rx.try_recv().is_ok() {}
        assert!(timeout(Duration::from_secs(30), rx.recv()).await.is_err()
            || rx.try_recv().is_err());
        let count = sink.emitted.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sink.emitted.lock().unwrap().len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_preserves_cursor_across_resume() {
        let (sink, mut rx) = RecordingSink::new(false);
        let session = AlternationSession::start(
            sink.clone(),
            palette(),
            cadence(),
            settings(),
            "vlc".into(),
        );

        // Take two emissions, pause mid-cycle.
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        session.pause();
        assert_eq!(session.state(), SessionState::Paused);

        // Allow any in-flight emission to land, then expect silence.
        tokio::time::sleep(Duration::from_secs(5)).await;
        while rx.try_recv().is_ok() {}
        assert!(timeout(Duration::from_secs(10), rx.recv()).await.is_err());

        session.resume();
        rx.recv().await.unwrap();
        session.stop().await;

        // The full record must be a prefix of the repeating cycle: a cursor
        // reset on pause would break the pattern.
        let seen = sink.emitted.lock().unwrap().clone();
        let p = palette();
        for (i, c) in seen.iter().enumerate() {
            assert_eq!(*c, p[i % p.len()], "cursor reset at emission {i}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sink_keeps_session_alive() {
        let (sink, mut rx) = RecordingSink::new(true);
        let session = AlternationSession::start(
            sink,
            palette(),
            cadence(),
            SessionSettings {
                max_failures: 2,
                backoff_factor: 2.0,
                ..settings()
            },
            "spotify".into(),
        );

        // Dispatch attempts keep coming despite consecutive failures.
        for _ in 0..6 {
            rx.recv().await.unwrap();
        }
        session.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_color_palette_skips_redundant_dispatch() {
        let (sink, mut rx) = RecordingSink::new(false);
        let session = AlternationSession::start(
            sink.clone(),
            vec![Color::new(10, 200, 10)],
            cadence(),
            settings(),
            "mpd".into(),
        );
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        session.stop().await;
        // Identical consecutive colors are not re-sent.
        assert_eq!(sink.emitted.lock().unwrap().len(), 1);
    }
}
