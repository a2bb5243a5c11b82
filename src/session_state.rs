//! Session state monitoring.
//!
//! Tracks which session owns the physical console and what kind of desktop
//! it is showing (login screen, locked, regular desktop). The rest of the
//! agent treats the latest snapshot as ground truth: the context switcher
//! impersonates into it, the capture loop and input dispatcher pass it to
//! every scoped block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::platform::Platform;

/// Poll cadence for the console session and input desktop.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive poll failures before the snapshot decays to `Unknown`.
const FAILURE_THRESHOLD: u32 = 3;

/// What the console is currently showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesktopMode {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "loginScreen")]
    LoginScreen,
    #[serde(rename = "desktop")]
    Desktop,
    #[serde(rename = "locked")]
    Locked,
}

impl DesktopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesktopMode::Unknown => "unknown",
            DesktopMode::LoginScreen => "loginScreen",
            DesktopMode::Desktop => "desktop",
            DesktopMode::Locked => "locked",
        }
    }
}

/// Immutable view of the console state at one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Active interactive session, `None` when the console has no session.
    pub session_id: Option<u32>,
    pub mode: DesktopMode,
}

impl SessionSnapshot {
    pub fn unknown() -> Self {
        Self {
            session_id: None,
            mode: DesktopMode::Unknown,
        }
    }
}

type Listener = Box<dyn Fn(&SessionSnapshot) + Send + Sync>;

/// Handle for removing a change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Shared {
    snapshot: Mutex<SessionSnapshot>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: std::sync::atomic::AtomicU64,
    consecutive_failures: Mutex<u32>,
}

impl Shared {
    fn publish(&self, next: SessionSnapshot) {
        let changed = {
            let mut current = self.snapshot.lock().unwrap();
            let changed = *current != next;
            *current = next;
            changed
        };

        if changed {
            info!(
                session_id = ?next.session_id,
                mode = next.mode.as_str(),
                "session state changed"
            );
            let listeners = self.listeners.lock().unwrap();
            for (_, listener) in listeners.iter() {
                listener(&next);
            }
        }
    }
}

/// Periodic console-session poller with a cached snapshot.
pub struct SessionMonitor {
    platform: Arc<dyn Platform>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionMonitor {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            shared: Arc::new(Shared {
                snapshot: Mutex::new(SessionSnapshot::unknown()),
                listeners: Mutex::new(Vec::new()),
                next_listener: std::sync::atomic::AtomicU64::new(1),
                consecutive_failures: Mutex::new(0),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Latest cached snapshot; cheap, never touches the OS.
    pub fn current(&self) -> SessionSnapshot {
        *self.shared.snapshot.lock().unwrap()
    }

    /// Register a listener invoked on every snapshot transition.
    pub fn on_change(
        &self,
        listener: impl Fn(&SessionSnapshot) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(
            self.shared
                .next_listener
                .fetch_add(1, Ordering::SeqCst),
        );
        self.shared
            .listeners
            .lock()
            .unwrap()
            .push((id, Box::new(listener)));
        id
    }

    /// Remove a previously registered listener.
    pub fn remove_listener(&self, id: ListenerId) {
        self.shared
            .listeners
            .lock()
            .unwrap()
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Start the polling thread. Idempotent.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }

        // Seed the cache so current() is meaningful before the first tick.
        Self::poll_once(&*self.platform, &self.shared);

        let platform = Arc::clone(&self.platform);
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);

        *handle = Some(std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(POLL_INTERVAL);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                Self::poll_once(&*platform, &shared);
            }
        }));

        info!("session monitor started");
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Force a poll now, outside the timer cadence.
    pub(crate) fn refresh(&self) {
        Self::poll_once(&*self.platform, &self.shared);
    }

    /// One poll: classify the input desktop and update the cache.
    ///
    /// A failed poll keeps the last-known snapshot for one cycle; after
    /// three consecutive failures the snapshot decays to `Unknown`.
    fn poll_once(platform: &dyn Platform, shared: &Shared) {
        let polled = platform.active_console_session().and_then(|session_id| {
            let mode = Self::classify(platform)?;
            Ok(SessionSnapshot { session_id, mode })
        });

        match polled {
            Ok(snapshot) => {
                *shared.consecutive_failures.lock().unwrap() = 0;
                shared.publish(snapshot);
            }
            Err(e) => {
                debug!("session poll failed: {}", e);
                let mut failures = shared.consecutive_failures.lock().unwrap();
                *failures += 1;
                if *failures >= FAILURE_THRESHOLD {
                    *failures = 0;
                    drop(failures);
                    warn!("session polling failed repeatedly, clearing state");
                    shared.publish(SessionSnapshot::unknown());
                }
            }
        }
    }

    fn classify(platform: &dyn Platform) -> Result<DesktopMode, crate::platform::PlatformError> {
        let name = platform.input_desktop_name()?;
        let mode = match name.to_lowercase().as_str() {
            "default" => DesktopMode::Desktop,
            "winlogon" => {
                if platform.interactive_user_present()? {
                    DesktopMode::Locked
                } else {
                    DesktopMode::LoginScreen
                }
            }
            _ => DesktopMode::Unknown,
        };
        Ok(mode)
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::headless::HeadlessPlatform;

    fn monitor() -> (Arc<HeadlessPlatform>, SessionMonitor) {
        let platform = Arc::new(HeadlessPlatform::new());
        let monitor = SessionMonitor::new(platform.clone());
        (platform, monitor)
    }

    #[test]
    fn classifies_default_desktop() {
        let (platform, monitor) = monitor();
        SessionMonitor::poll_once(&*platform, &monitor.shared);
        let snapshot = monitor.current();
        assert_eq!(snapshot.mode, DesktopMode::Desktop);
        assert_eq!(snapshot.session_id, Some(1));
    }

    #[test]
    fn winlogon_with_user_is_locked() {
        let (platform, monitor) = monitor();
        platform.set_desktop_name("Winlogon");
        platform.set_user_present(true);
        SessionMonitor::poll_once(&*platform, &monitor.shared);
        assert_eq!(monitor.current().mode, DesktopMode::Locked);
    }

    #[test]
    fn winlogon_without_user_is_login_screen() {
        let (platform, monitor) = monitor();
        platform.set_desktop_name("Winlogon");
        platform.set_user_present(false);
        SessionMonitor::poll_once(&*platform, &monitor.shared);
        assert_eq!(monitor.current().mode, DesktopMode::LoginScreen);
    }

    #[test]
    fn unrecognized_desktop_is_unknown() {
        let (platform, monitor) = monitor();
        platform.set_desktop_name("Screen-saver");
        SessionMonitor::poll_once(&*platform, &monitor.shared);
        assert_eq!(monitor.current().mode, DesktopMode::Unknown);
    }

    #[test]
    fn poll_failures_keep_snapshot_until_threshold() {
        let (platform, monitor) = monitor();
        SessionMonitor::poll_once(&*platform, &monitor.shared);
        assert_eq!(monitor.current().mode, DesktopMode::Desktop);

        // Two failures: last-known snapshot survives.
        platform.fail_next_polls(2);
        SessionMonitor::poll_once(&*platform, &monitor.shared);
        SessionMonitor::poll_once(&*platform, &monitor.shared);
        assert_eq!(monitor.current().mode, DesktopMode::Desktop);

        // Third consecutive failure clears to unknown.
        platform.fail_next_polls(3);
        for _ in 0..3 {
            SessionMonitor::poll_once(&*platform, &monitor.shared);
        }
        assert_eq!(monitor.current(), SessionSnapshot::unknown());
    }

    #[test]
    fn listeners_observe_transitions() {
        let (platform, monitor) = monitor();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.on_change(move |snapshot| sink.lock().unwrap().push(*snapshot));

        SessionMonitor::poll_once(&*platform, &monitor.shared);
        platform.set_desktop_name("Winlogon");
        SessionMonitor::poll_once(&*platform, &monitor.shared);
        // No transition: same state polled again.
        SessionMonitor::poll_once(&*platform, &monitor.shared);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].mode, DesktopMode::Desktop);
        assert_eq!(seen[1].mode, DesktopMode::Locked);
    }

    #[test]
    fn removed_listeners_stop_observing() {
        let (platform, monitor) = monitor();
        let seen = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&seen);
        let id = monitor.on_change(move |_| *sink.lock().unwrap() += 1);

        SessionMonitor::poll_once(&*platform, &monitor.shared);
        assert_eq!(*seen.lock().unwrap(), 1);

        monitor.remove_listener(id);
        platform.set_desktop_name("Winlogon");
        SessionMonitor::poll_once(&*platform, &monitor.shared);
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
