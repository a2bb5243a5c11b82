//! In-memory platform used on non-Windows hosts and throughout the tests.
//!
//! Supplies a fabricated pixel source, records every synthetic input it is
//! asked to emit, and lets tests script display layouts, desktop names, and
//! capture failures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{
    CaptureStrategy, CaptureSurface, DisplayDevice, KeyTranslation, Platform, PlatformError,
    PointerInput, PowerAction, Rect, ScopeToken,
};

/// Everything a test might want to script or inspect.
#[derive(Debug)]
struct State {
    session_id: Option<u32>,
    desktop_name: String,
    user_present: bool,
    devices: Vec<DisplayDevice>,
    monitors: Vec<DisplayDevice>,
    injected: Vec<RecordedInput>,
    cursor: (i32, i32),
    active_scopes: u32,
    scopes_opened: u64,
    power_requests: Vec<PowerAction>,
    poll_failures: u32,
    key_calls: u64,
    key_fail_at: Option<u64>,
}

/// One recorded synthetic emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedInput {
    Pointer(PointerInput),
    Key { vk: u16, pressed: bool },
    SecureAttention,
}

pub struct HeadlessPlatform {
    state: Arc<Mutex<State>>,
    /// Countdown of scripted capture failures shared with live surfaces.
    capture_failures: Arc<AtomicU32>,
}

fn default_display() -> DisplayDevice {
    DisplayDevice {
        device_name: r"\\.\DISPLAY1".to_string(),
        friendly_name: "Headless Display".to_string(),
        x: 0,
        y: 0,
        width: 1280,
        height: 800,
        primary: true,
    }
}

impl HeadlessPlatform {
    pub fn new() -> Self {
        let display = default_display();
        Self {
            state: Arc::new(Mutex::new(State {
                session_id: Some(1),
                desktop_name: "Default".to_string(),
                user_present: true,
                devices: vec![display.clone()],
                monitors: vec![display],
                injected: Vec::new(),
                cursor: (0, 0),
                active_scopes: 0,
                scopes_opened: 0,
                power_requests: Vec::new(),
                poll_failures: 0,
                key_calls: 0,
                key_fail_at: None,
            })),
            capture_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Replace both enumeration sources with the same display list.
    pub fn set_displays(&self, displays: Vec<DisplayDevice>) {
        let mut state = self.state.lock().unwrap();
        state.devices = displays.clone();
        state.monitors = displays;
    }

    /// Script the two enumeration sources independently.
    pub fn set_display_sources(&self, devices: Vec<DisplayDevice>, monitors: Vec<DisplayDevice>) {
        let mut state = self.state.lock().unwrap();
        state.devices = devices;
        state.monitors = monitors;
    }

    pub fn set_desktop_name(&self, name: &str) {
        self.state.lock().unwrap().desktop_name = name.to_string();
    }

    pub fn set_user_present(&self, present: bool) {
        self.state.lock().unwrap().user_present = present;
    }

    pub fn set_session(&self, session_id: Option<u32>) {
        self.state.lock().unwrap().session_id = session_id;
    }

    /// Make the next `n` session/desktop polls fail.
    pub fn fail_next_polls(&self, n: u32) {
        self.state.lock().unwrap().poll_failures = n;
    }

    /// Make the next `n` capture attempts fail, across all strategies.
    pub fn fail_next_captures(&self, n: u32) {
        self.capture_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the `n`-th `send_key` call from now (1-based).
    pub fn fail_key_at(&self, n: u64) {
        let mut state = self.state.lock().unwrap();
        let base = state.key_calls;
        state.key_fail_at = Some(base + n);
    }

    pub fn injected_events(&self) -> Vec<RecordedInput> {
        self.state.lock().unwrap().injected.clone()
    }

    pub fn clear_injected(&self) {
        self.state.lock().unwrap().injected.clear();
    }

    pub fn cursor_pos(&self) -> (i32, i32) {
        self.state.lock().unwrap().cursor
    }

    pub fn active_scope_count(&self) -> u32 {
        self.state.lock().unwrap().active_scopes
    }

    pub fn scopes_opened(&self) -> u64 {
        self.state.lock().unwrap().scopes_opened
    }

    pub fn power_requests(&self) -> Vec<PowerAction> {
        self.state.lock().unwrap().power_requests.clone()
    }

    fn take_poll_failure(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.poll_failures > 0 {
            state.poll_failures -= 1;
            true
        } else {
            false
        }
    }
}

impl Default for HeadlessPlatform {
    fn default() -> Self {
        Self::new()
    }
}

struct HeadlessScope {
    state: Arc<Mutex<State>>,
}

impl ScopeToken for HeadlessScope {}

impl Drop for HeadlessScope {
    fn drop(&mut self) {
        self.state.lock().unwrap().active_scopes -= 1;
    }
}

struct HeadlessSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    failures: Arc<AtomicU32>,
}

impl CaptureSurface for HeadlessSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn capture(
        &mut self,
        strategy: CaptureStrategy,
        src_x: i32,
        src_y: i32,
    ) -> Result<&[u8], PlatformError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(PlatformError::api("capture", "scripted failure"));
        }

        debug!(?strategy, src_x, src_y, "headless capture");

        // Deterministic non-black test pattern, BGRA.
        for y in 0..self.height {
            for x in 0..self.width {
                let offset = ((y * self.width + x) * 4) as usize;
                self.pixels[offset] = ((x ^ y) & 0xFF) as u8;
                self.pixels[offset + 1] = (x & 0xFF) as u8;
                self.pixels[offset + 2] = (y & 0xFF) as u8;
                self.pixels[offset + 3] = 0xFF;
            }
        }
        Ok(&self.pixels)
    }
}

impl Platform for HeadlessPlatform {
    fn active_console_session(&self) -> Result<Option<u32>, PlatformError> {
        if self.take_poll_failure() {
            return Err(PlatformError::api("active_console_session", "scripted failure"));
        }
        Ok(self.state.lock().unwrap().session_id)
    }

    fn input_desktop_name(&self) -> Result<String, PlatformError> {
        if self.take_poll_failure() {
            return Err(PlatformError::api("input_desktop_name", "scripted failure"));
        }
        Ok(self.state.lock().unwrap().desktop_name.clone())
    }

    fn interactive_user_present(&self) -> Result<bool, PlatformError> {
        Ok(self.state.lock().unwrap().user_present)
    }

    fn attach_input_desktop(&self, session_id: u32) -> Result<Box<dyn ScopeToken>, PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.session_id != Some(session_id) {
            return Err(PlatformError::NoActiveSession);
        }
        state.active_scopes += 1;
        state.scopes_opened += 1;
        Ok(Box::new(HeadlessScope {
            state: Arc::clone(&self.state),
        }))
    }

    fn enumerate_display_devices(&self) -> Result<Vec<DisplayDevice>, PlatformError> {
        Ok(self.state.lock().unwrap().devices.clone())
    }

    fn enumerate_display_monitors(&self) -> Result<Vec<DisplayDevice>, PlatformError> {
        Ok(self.state.lock().unwrap().monitors.clone())
    }

    fn virtual_desktop_rect(&self) -> Result<Rect, PlatformError> {
        let state = self.state.lock().unwrap();
        let mut min_x = i32::MAX;
        let mut min_y = i32::MAX;
        let mut max_x = i32::MIN;
        let mut max_y = i32::MIN;
        for display in &state.monitors {
            let bounds = display.bounds();
            min_x = min_x.min(bounds.x);
            min_y = min_y.min(bounds.y);
            max_x = max_x.max(bounds.right());
            max_y = max_y.max(bounds.bottom());
        }
        if min_x > max_x {
            return Err(PlatformError::api("virtual_desktop_rect", "no displays"));
        }
        Ok(Rect {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        })
    }

    fn create_capture_surface(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn CaptureSurface>, PlatformError> {
        if width == 0 || height == 0 {
            return Err(PlatformError::OutOfBounds);
        }
        Ok(Box::new(HeadlessSurface {
            width,
            height,
            pixels: vec![0u8; (width * height * 4) as usize],
            failures: Arc::clone(&self.capture_failures),
        }))
    }

    fn send_pointer(&self, input: PointerInput) -> Result<(), PlatformError> {
        let virtual_rect = self.virtual_desktop_rect()?;
        let mut state = self.state.lock().unwrap();
        match input {
            PointerInput::MoveRelative { dx, dy } => {
                state.cursor.0 += dx;
                state.cursor.1 += dy;
            }
            PointerInput::MoveAbsoluteVirtual { norm_x, norm_y } => {
                // Reverse of the dispatcher's normalization: pixel position
                // over the virtual desktop with rounding.
                let scale = |norm: i32, span: i32| -> i32 {
                    ((norm as i64 * (span as i64 - 1) + 32767) / 65535) as i32
                };
                state.cursor = (
                    virtual_rect.x + scale(norm_x, virtual_rect.width),
                    virtual_rect.y + scale(norm_y, virtual_rect.height),
                );
            }
            _ => {}
        }
        state.injected.push(RecordedInput::Pointer(input));
        Ok(())
    }

    fn send_key(&self, vk: u16, pressed: bool) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.key_calls += 1;
        if state.key_fail_at == Some(state.key_calls) {
            state.key_fail_at = None;
            return Err(PlatformError::api("send_key", "scripted failure"));
        }
        state.injected.push(RecordedInput::Key { vk, pressed });
        Ok(())
    }

    fn translate_char(&self, c: char) -> Option<KeyTranslation> {
        // ASCII-only layout; enough to exercise the text path.
        match c {
            'a'..='z' => Some(KeyTranslation {
                vk: 0x41 + (c as u16 - 'a' as u16),
                shift: false,
            }),
            'A'..='Z' => Some(KeyTranslation {
                vk: 0x41 + (c as u16 - 'A' as u16),
                shift: true,
            }),
            '0'..='9' => Some(KeyTranslation {
                vk: 0x30 + (c as u16 - '0' as u16),
                shift: false,
            }),
            ' ' => Some(KeyTranslation { vk: 0x20, shift: false }),
            '!' => Some(KeyTranslation { vk: 0x31, shift: true }),
            '.' => Some(KeyTranslation { vk: 0xBE, shift: false }),
            ',' => Some(KeyTranslation { vk: 0xBC, shift: false }),
            '\n' => Some(KeyTranslation { vk: 0x0D, shift: false }),
            _ => None,
        }
    }

    fn warp_cursor(&self, x: i32, y: i32) -> Result<(), PlatformError> {
        self.state.lock().unwrap().cursor = (x, y);
        Ok(())
    }

    fn send_secure_attention(&self) -> Result<(), PlatformError> {
        self.state
            .lock()
            .unwrap()
            .injected
            .push(RecordedInput::SecureAttention);
        Ok(())
    }

    fn unprotect_secret(&self, blob: &[u8]) -> Result<Vec<u8>, PlatformError> {
        // No machine key off-Windows; the blob is returned as-is.
        Ok(blob.to_vec())
    }

    fn power_action(&self, action: PowerAction) -> Result<(), PlatformError> {
        self.state.lock().unwrap().power_requests.push(action);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_tokens_balance() {
        let platform = HeadlessPlatform::new();
        assert_eq!(platform.active_scope_count(), 0);
        let token = platform.attach_input_desktop(1).unwrap();
        assert_eq!(platform.active_scope_count(), 1);
        drop(token);
        assert_eq!(platform.active_scope_count(), 0);
    }

    #[test]
    fn capture_produces_non_black_pixels() {
        let platform = HeadlessPlatform::new();
        let mut surface = platform.create_capture_surface(16, 16).unwrap();
        let pixels = surface
            .capture(CaptureStrategy::ScreenSurface, 0, 0)
            .unwrap();
        assert!(pixels.iter().any(|&b| b != 0));
    }

    #[test]
    fn scripted_capture_failures_drain() {
        let platform = HeadlessPlatform::new();
        platform.fail_next_captures(2);
        let mut surface = platform.create_capture_surface(8, 8).unwrap();
        assert!(surface.capture(CaptureStrategy::DesktopWindowDc, 0, 0).is_err());
        assert!(surface.capture(CaptureStrategy::ScreenSurface, 0, 0).is_err());
        assert!(surface.capture(CaptureStrategy::ScreenSurface, 0, 0).is_ok());
    }

    #[test]
    fn translate_char_uppercase_requires_shift() {
        let platform = HeadlessPlatform::new();
        let lower = platform.translate_char('g').unwrap();
        let upper = platform.translate_char('G').unwrap();
        assert_eq!(lower.vk, upper.vk);
        assert!(!lower.shift);
        assert!(upper.shift);
    }
}
