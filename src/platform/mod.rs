//! Platform primitives behind the core components.
//!
//! Everything the agent needs from the host OS is expressed as the
//! [`Platform`] trait:
//! - Active console session and input desktop queries
//! - Desktop/session scope attachment (impersonation + desktop switch)
//! - Display enumeration from two independent sources
//! - Rectangle capture into a reusable pixel buffer
//! - Synthetic pointer/keyboard input and layout-aware key translation
//! - Machine-keyed secret unprotection and power control
//!
//! The Win32 implementation lives in [`windows`]; every other host (and the
//! entire test suite) runs on [`headless`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod headless;
#[cfg(windows)]
pub mod windows;

/// Sentinel returned by the console-session query when no session is
/// attached to the physical console.
pub const NO_SESSION: u32 = 0xFFFF_FFFF;

/// Errors surfaced by platform calls.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("no active console session")]
    NoActiveSession,

    #[error("{call} failed: {detail}")]
    Api { call: &'static str, detail: String },

    #[error("capture source rectangle out of bounds")]
    OutOfBounds,

    #[error("operation not supported on this host")]
    Unsupported,
}

impl PlatformError {
    pub fn api(call: &'static str, detail: impl Into<String>) -> Self {
        Self::Api {
            call,
            detail: detail.into(),
        }
    }
}

/// A rectangle in virtual-desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }
}

/// One physical display as reported by an enumeration source.
///
/// `device_name` is the OS device path (e.g. `\\.\DISPLAY1`); the stable
/// public ids are assigned later by the capture engine after merge + sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayDevice {
    pub device_name: String,
    pub friendly_name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub primary: bool,
}

impl DisplayDevice {
    pub fn bounds(&self) -> Rect {
        Rect {
            x: self.x,
            y: self.y,
            width: self.width as i32,
            height: self.height as i32,
        }
    }
}

/// Pointer buttons the agent can synthesize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerButton {
    Left,
    Right,
    Middle,
}

/// A fully resolved synthetic pointer emission.
///
/// Coordinate mapping (monitor box, virtual-desktop normalization) happens
/// in the input dispatcher; by the time an event reaches the platform it is
/// already in the form the synthetic-input API wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerInput {
    /// Relative move in pixels.
    MoveRelative { dx: i32, dy: i32 },
    /// Absolute move, normalized to `[0, 65535]` against the virtual
    /// desktop, emitted with the absolute + virtual-desktop flags.
    MoveAbsoluteVirtual { norm_x: i32, norm_y: i32 },
    Button { button: PointerButton, pressed: bool },
    WheelVertical { delta: i32 },
    WheelHorizontal { delta: i32 },
}

/// Result of translating a character through the active keyboard layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTranslation {
    /// Virtual-key code for the character.
    pub vk: u16,
    /// Whether Shift must be held to produce the character.
    pub shift: bool,
}

/// Power actions the control plane can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Restart,
    Shutdown,
}

/// Capture strategies, tried in order by the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// Acquire the desktop window's DC from the switched desktop and blit.
    DesktopWindowDc,
    /// Blit after the desktop switch alone, without re-acquiring the
    /// desktop window DC.
    SwitchedDesktopBlit,
    /// Direct blit from the default screen surface.
    ScreenSurface,
}

impl CaptureStrategy {
    /// The ladder the capture loop walks each iteration.
    pub const LADDER: [CaptureStrategy; 3] = [
        CaptureStrategy::DesktopWindowDc,
        CaptureStrategy::SwitchedDesktopBlit,
        CaptureStrategy::ScreenSurface,
    ];
}

/// A reusable capture target of fixed dimensions.
///
/// Owns the OS handles and the pixel buffer needed to blit a `(w, h)`
/// rectangle from a source surface. Exclusively owned by the capture loop;
/// reallocated by it when the selected monitor's dimensions change.
pub trait CaptureSurface: Send {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Blit `(src_x, src_y, w, h)` from the source surface selected by
    /// `strategy` into the internal bitmap and return the BGRA pixels.
    fn capture(
        &mut self,
        strategy: CaptureStrategy,
        src_x: i32,
        src_y: i32,
    ) -> Result<&[u8], PlatformError>;
}

/// Token representing an acquired desktop/impersonation scope.
///
/// Dropping the token performs the LIFO release: restore the prior desktop
/// handle, close the opened desktop, revert the thread token, close the
/// token handle. Deliberately `!Send` - the scope is bound to the thread
/// that acquired it.
pub trait ScopeToken {}

/// Host capability set consumed by the core components.
pub trait Platform: Send + Sync {
    /// Session id currently attached to the physical console, or `None`
    /// when the console has no session.
    fn active_console_session(&self) -> Result<Option<u32>, PlatformError>;

    /// Name of the desktop currently receiving input (`Default`,
    /// `Winlogon`, ...).
    fn input_desktop_name(&self) -> Result<String, PlatformError>;

    /// Whether any interactive session has a logged-on user. Splits a
    /// `Winlogon` input desktop into login-screen (no user) vs locked
    /// (user present behind the secure desktop).
    fn interactive_user_present(&self) -> Result<bool, PlatformError>;

    /// Impersonate the session's user and attach the calling thread to its
    /// input desktop. Returns the release token; the caller keeps it alive
    /// for the duration of the scoped work.
    fn attach_input_desktop(&self, session_id: u32) -> Result<Box<dyn ScopeToken>, PlatformError>;

    /// Display list from the device-oriented enumeration source.
    fn enumerate_display_devices(&self) -> Result<Vec<DisplayDevice>, PlatformError>;

    /// Display list from the monitor-oriented enumeration source.
    fn enumerate_display_monitors(&self) -> Result<Vec<DisplayDevice>, PlatformError>;

    /// Bounding rectangle of the union of all monitors.
    fn virtual_desktop_rect(&self) -> Result<Rect, PlatformError>;

    /// Allocate a reusable capture target of the given dimensions.
    fn create_capture_surface(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn CaptureSurface>, PlatformError>;

    fn send_pointer(&self, input: PointerInput) -> Result<(), PlatformError>;

    fn send_key(&self, vk: u16, pressed: bool) -> Result<(), PlatformError>;

    /// Translate a character to a virtual key through the active keyboard
    /// layout. `None` when the layout cannot produce the character.
    fn translate_char(&self, c: char) -> Option<KeyTranslation>;

    /// Move the hardware cursor to an absolute pixel position in
    /// virtual-desktop coordinates.
    fn warp_cursor(&self, x: i32, y: i32) -> Result<(), PlatformError>;

    /// Deliver the secure attention sequence (Ctrl+Alt+Del).
    fn send_secure_attention(&self) -> Result<(), PlatformError>;

    /// Decrypt a machine-keyed protected blob (certificate password).
    fn unprotect_secret(&self, blob: &[u8]) -> Result<Vec<u8>, PlatformError>;

    fn power_action(&self, action: PowerAction) -> Result<(), PlatformError>;
}

/// The platform for the host this binary runs on.
pub fn native() -> Arc<dyn Platform> {
    #[cfg(windows)]
    {
        Arc::new(windows::WindowsPlatform::new())
    }
    #[cfg(not(windows))]
    {
        Arc::new(headless::HeadlessPlatform::new())
    }
}
