//! Agent composition root.
//!
//! Wires the platform, session monitor, capture engine, input dispatcher,
//! broker, and peripherals together and owns their lifecycle. The HTTP
//! layer holds an `Arc<Agent>` as its shared state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::audio::AudioControl;
use crate::broker::SessionBroker;
use crate::capture::CaptureEngine;
use crate::config::Settings;
use crate::input::InputDispatcher;
use crate::platform::Platform;
use crate::power::PowerControl;
use crate::session_state::SessionMonitor;

pub struct Agent {
    pub agent_id: String,
    pub settings: Settings,
    pub platform: Arc<dyn Platform>,
    pub session: Arc<SessionMonitor>,
    pub engine: Arc<CaptureEngine>,
    pub dispatcher: Arc<InputDispatcher>,
    pub broker: Arc<SessionBroker>,
    pub audio: Arc<dyn AudioControl>,
    pub power: PowerControl,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(
        agent_id: String,
        settings: Settings,
        platform: Arc<dyn Platform>,
        audio: Arc<dyn AudioControl>,
    ) -> Arc<Self> {
        let session = Arc::new(SessionMonitor::new(Arc::clone(&platform)));
        let engine = Arc::new(CaptureEngine::new(
            Arc::clone(&platform),
            Arc::clone(&session),
            settings.capture_fps,
        ));
        let dispatcher = Arc::new(InputDispatcher::new(
            Arc::clone(&platform),
            Arc::clone(&session),
            engine.selection(),
        ));
        let broker = SessionBroker::new(
            settings.allowlist.clone(),
            settings.allow_empty_allowlist,
            settings.max_sessions,
        );
        let power = PowerControl::new(Arc::clone(&platform));

        Arc::new(Self {
            agent_id,
            settings,
            platform,
            session,
            engine,
            dispatcher,
            broker,
            audio,
            power,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the background machinery: session polling, the capture loop,
    /// and the broker purge task. Must run inside a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        self.session.start();
        self.engine.start();

        let broker = Arc::clone(&self.broker);
        let shutdown = self.shutdown.clone();
        tokio::spawn(broker.run_purge_loop(shutdown));

        info!(agent_id = %self.agent_id, "agent started");
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Graceful stop: HTTP shutdown is signalled first, then the capture
    /// loop joins, then session polling ends.
    pub fn stop(&self) {
        info!("agent stopping");
        self.shutdown.cancel();
        self.engine.stop();
        self.session.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::HeadlessAudio;
    use crate::platform::headless::HeadlessPlatform;

    #[tokio::test(flavor = "multi_thread")]
    async fn agent_starts_and_stops() {
        let platform = Arc::new(HeadlessPlatform::new());
        let agent = Agent::new(
            "agent-test".to_string(),
            Settings::default(),
            platform,
            Arc::new(HeadlessAudio::new()),
        );

        agent.start();
        assert!(agent.engine.status().running);
        assert_eq!(agent.session.current().mode.as_str(), "desktop");

        agent.stop();
        assert!(!agent.engine.status().running);
        assert!(agent.shutdown_token().is_cancelled());
    }
}
