//! Audio peripheral interface.
//!
//! The control plane passes audio requests through to this collaborator.
//! Per-session output routing is not guaranteed by the host mixer API;
//! when it fails the route is applied to the system default instead, and
//! the outcome reports which target actually took effect so the caller is
//! never misled.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio subsystem unavailable")]
    Unavailable,

    #[error("unknown audio device: {0}")]
    UnknownDevice(String),

    #[error("unknown audio session: {0}")]
    UnknownSession(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSessionInfo {
    pub key: String,
    pub display_name: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioState {
    pub devices: Vec<AudioDevice>,
    pub sessions: Vec<AudioSessionInfo>,
}

/// Where a session-route request actually landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTarget {
    Session,
    SystemDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioRouteOutcome {
    pub applied_to: SessionTarget,
}

pub trait AudioControl: Send + Sync {
    fn state(&self) -> Result<AudioState, AudioError>;

    fn set_default_device(&self, device_id: &str) -> Result<(), AudioError>;

    /// Route one audio session to a device. May fall back to changing the
    /// system default; the outcome says which happened.
    fn set_session_route(
        &self,
        session_key: &str,
        device_id: &str,
    ) -> Result<AudioRouteOutcome, AudioError>;
}

/// In-memory mixer used off-Windows and in tests.
pub struct HeadlessAudio {
    state: Mutex<AudioState>,
    /// When set, per-session routing fails and falls back to the default.
    session_routing_broken: Mutex<bool>,
}

impl HeadlessAudio {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AudioState {
                devices: vec![
                    AudioDevice {
                        id: "out0".to_string(),
                        name: "Speakers".to_string(),
                        is_default: true,
                    },
                    AudioDevice {
                        id: "out1".to_string(),
                        name: "Headphones".to_string(),
                        is_default: false,
                    },
                ],
                sessions: vec![AudioSessionInfo {
                    key: "app:media".to_string(),
                    display_name: "Media Player".to_string(),
                    device_id: "out0".to_string(),
                }],
            }),
            session_routing_broken: Mutex::new(false),
        }
    }

    /// Simulate the hosts where per-session routing is unavailable.
    pub fn break_session_routing(&self) {
        *self.session_routing_broken.lock().unwrap() = true;
    }
}

impl Default for HeadlessAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioControl for HeadlessAudio {
    fn state(&self) -> Result<AudioState, AudioError> {
        Ok(self.state.lock().unwrap().clone())
    }

    fn set_default_device(&self, device_id: &str) -> Result<(), AudioError> {
        let mut state = self.state.lock().unwrap();
        if !state.devices.iter().any(|d| d.id == device_id) {
            return Err(AudioError::UnknownDevice(device_id.to_string()));
        }
        for device in &mut state.devices {
            device.is_default = device.id == device_id;
        }
        Ok(())
    }

    fn set_session_route(
        &self,
        session_key: &str,
        device_id: &str,
    ) -> Result<AudioRouteOutcome, AudioError> {
        {
            let state = self.state.lock().unwrap();
            if !state.devices.iter().any(|d| d.id == device_id) {
                return Err(AudioError::UnknownDevice(device_id.to_string()));
            }
            if !state.sessions.iter().any(|s| s.key == session_key) {
                return Err(AudioError::UnknownSession(session_key.to_string()));
            }
        }

        if *self.session_routing_broken.lock().unwrap() {
            warn!(
                session_key,
                device_id, "per-session routing failed, changing system default instead"
            );
            self.set_default_device(device_id)?;
            return Ok(AudioRouteOutcome {
                applied_to: SessionTarget::SystemDefault,
            });
        }

        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.iter_mut().find(|s| s.key == session_key) {
            session.device_id = device_id.to_string();
        }
        Ok(AudioRouteOutcome {
            applied_to: SessionTarget::Session,
        })
    }
}
