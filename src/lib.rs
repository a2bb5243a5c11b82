//! Remote Control Agent.
//!
//! A host-resident daemon exposing a local-network control plane for a
//! single Windows workstation: an authenticated REST API for lifecycle
//! and state, a full-duplex channel streaming the active desktop as JPEG
//! frames while ingesting remote pointer/keyboard input, and peripheral
//! control over audio and power.
//!
//! The capture/input/session core works across session boundaries: the
//! agent runs as a system service isolated from interactive sessions, and
//! attaches per-operation to the active input desktop, so the stream
//! stays live at the login screen, on the lock screen, and inside a
//! logged-in session.

pub mod agent;
pub mod audio;
pub mod broker;
pub mod capture;
pub mod config;
pub mod desktop_scope;
pub mod http;
pub mod input;
pub mod platform;
pub mod power;
pub mod protocol;
pub mod session_state;
