//! Input dispatching.
//!
//! Translates remote pointer/keyboard intents into synthetic input on the
//! active input desktop. All dispatches serialize on one lock so an event
//! completes before the next starts, and every emission runs inside a
//! desktop scope built from the latest session snapshot.
//!
//! Modifier discipline: key-down presses modifiers in the fixed order
//! Ctrl, Alt, Shift, Win before the main key; key-up releases the main key
//! and then the modifiers in reverse. A partial failure during key-down or
//! text emission releases whatever was pressed, in reverse, so no modifier
//! is left stuck.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capture::MonitorSelection;
use crate::desktop_scope;
use crate::platform::{Platform, PlatformError, PointerButton, PointerInput};
use crate::session_state::SessionMonitor;

const VK_SHIFT: u16 = 0x10;
const VK_CONTROL: u16 = 0x11;
const VK_MENU: u16 = 0x12;
const VK_LWIN: u16 = 0x5B;

/// Relative pointer deltas are clamped to this magnitude.
const RELATIVE_CLAMP: i32 = 32767;

/// Normalized absolute coordinates live in `[0, NORMALIZED_MAX]`.
const NORMALIZED_MAX: i32 = 65535;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("no monitor selected for absolute positioning")]
    NoMonitorSelected,

    #[error("character has no key mapping: {0:?}")]
    Untranslatable(char),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonAction {
    Down,
    Up,
}

/// Pointer intents accepted from the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvent {
    /// Relative move; deltas clamped to `[-32767, 32767]`.
    MoveRelative { dx: i32, dy: i32 },
    /// Absolute move; coordinates normalized to `[0, 65535]` over the
    /// selected monitor's pixel box.
    MoveAbsolute { x: i32, y: i32 },
    Button {
        button: PointerButton,
        action: ButtonAction,
    },
    /// Wheel deltas; nonzero horizontal and vertical components are
    /// emitted as two separate events.
    Wheel { dx: i32, dy: i32 },
}

/// Modifier set carried by keyboard intents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub ctrl: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub win: bool,
}

impl Modifiers {
    /// Virtual keys in press order: Ctrl, Alt, Shift, Win.
    fn press_order(&self) -> Vec<u16> {
        let mut keys = Vec::with_capacity(4);
        if self.ctrl {
            keys.push(VK_CONTROL);
        }
        if self.alt {
            keys.push(VK_MENU);
        }
        if self.shift {
            keys.push(VK_SHIFT);
        }
        if self.win {
            keys.push(VK_LWIN);
        }
        keys
    }

    fn with_shift(mut self) -> Self {
        self.shift = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyboardEvent {
    KeyDown { vk: u16, modifiers: Modifiers },
    KeyUp { vk: u16, modifiers: Modifiers },
    Text { text: String, modifiers: Modifiers },
}

/// Fixed key sequences with special handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialCombo {
    /// Secure attention sequence; delivered through the platform, not as
    /// plain key events.
    CtrlAltDel,
    WinL,
    AltTab,
    WinD,
    CtrlShiftEsc,
}

impl SpecialCombo {
    /// Press/release table for combos that are plain key sequences.
    fn key_sequence(&self) -> Option<&'static [(u16, bool)]> {
        match self {
            SpecialCombo::CtrlAltDel => None,
            SpecialCombo::WinL => Some(&[
                (VK_LWIN, true),
                (0x4C, true),
                (0x4C, false),
                (VK_LWIN, false),
            ]),
            SpecialCombo::AltTab => Some(&[
                (VK_MENU, true),
                (0x09, true),
                (0x09, false),
                (VK_MENU, false),
            ]),
            SpecialCombo::WinD => Some(&[
                (VK_LWIN, true),
                (0x44, true),
                (0x44, false),
                (VK_LWIN, false),
            ]),
            SpecialCombo::CtrlShiftEsc => Some(&[
                (VK_CONTROL, true),
                (VK_SHIFT, true),
                (0x1B, true),
                (0x1B, false),
                (VK_SHIFT, false),
                (VK_CONTROL, false),
            ]),
        }
    }
}

/// Releases pressed modifiers in reverse order unless disarmed.
struct ModifierGuard<'a> {
    platform: &'a dyn Platform,
    pressed: Vec<u16>,
    armed: bool,
}

impl<'a> ModifierGuard<'a> {
    fn new(platform: &'a dyn Platform) -> Self {
        Self {
            platform,
            pressed: Vec::new(),
            armed: true,
        }
    }

    fn press(&mut self, vk: u16) -> Result<(), InputError> {
        self.platform.send_key(vk, true)?;
        self.pressed.push(vk);
        Ok(())
    }

    /// Release everything now, in reverse press order. Continues past
    /// individual failures so no modifier stays stuck.
    fn release(mut self) -> Result<(), InputError> {
        self.armed = false;
        let mut first_error = None;
        for vk in self.pressed.drain(..).rev() {
            if let Err(e) = self.platform.send_key(vk, false) {
                warn!(vk, "modifier release failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Keep the modifiers pressed (the matching key-up will release them).
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ModifierGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for vk in self.pressed.drain(..).rev() {
            let _ = self.platform.send_key(vk, false);
        }
    }
}

pub struct InputDispatcher {
    platform: Arc<dyn Platform>,
    session: Arc<SessionMonitor>,
    selection: Arc<MonitorSelection>,
    /// One event completes before the next starts.
    dispatch_lock: Mutex<()>,
}

impl InputDispatcher {
    pub fn new(
        platform: Arc<dyn Platform>,
        session: Arc<SessionMonitor>,
        selection: Arc<MonitorSelection>,
    ) -> Self {
        Self {
            platform,
            session,
            selection,
            dispatch_lock: Mutex::new(()),
        }
    }

    pub fn dispatch_pointer(&self, event: PointerEvent) -> Result<(), InputError> {
        let _serialized = self.dispatch_lock.lock().unwrap();
        let snapshot = self.session.current();
        desktop_scope::run_scoped(&*self.platform, Some(snapshot), || {
            self.emit_pointer(event)
        })
    }

    pub fn dispatch_keyboard(&self, event: KeyboardEvent) -> Result<(), InputError> {
        let _serialized = self.dispatch_lock.lock().unwrap();
        let snapshot = self.session.current();
        desktop_scope::run_scoped(&*self.platform, Some(snapshot), || {
            self.emit_keyboard(event)
        })
    }

    pub fn dispatch_special(&self, combo: SpecialCombo) -> Result<(), InputError> {
        let _serialized = self.dispatch_lock.lock().unwrap();
        let snapshot = self.session.current();
        desktop_scope::run_scoped(&*self.platform, Some(snapshot), || match combo
            .key_sequence()
        {
            Some(sequence) => {
                for &(vk, pressed) in sequence {
                    self.platform.send_key(vk, pressed)?;
                }
                Ok(())
            }
            None => {
                debug!("delivering secure attention sequence");
                self.platform.send_secure_attention()?;
                Ok(())
            }
        })
    }

    fn emit_pointer(&self, event: PointerEvent) -> Result<(), InputError> {
        match event {
            PointerEvent::MoveRelative { dx, dy } => {
                let input = PointerInput::MoveRelative {
                    dx: dx.clamp(-RELATIVE_CLAMP, RELATIVE_CLAMP),
                    dy: dy.clamp(-RELATIVE_CLAMP, RELATIVE_CLAMP),
                };
                self.platform.send_pointer(input)?;
            }
            PointerEvent::MoveAbsolute { x, y } => {
                let (norm_x, norm_y) = self.map_absolute(x, y)?;
                self.platform
                    .send_pointer(PointerInput::MoveAbsoluteVirtual { norm_x, norm_y })?;
            }
            PointerEvent::Button { button, action } => {
                self.platform.send_pointer(PointerInput::Button {
                    button,
                    pressed: action == ButtonAction::Down,
                })?;
            }
            PointerEvent::Wheel { dx, dy } => {
                let dy = dy.clamp(i16::MIN as i32, i16::MAX as i32);
                let dx = dx.clamp(i16::MIN as i32, i16::MAX as i32);
                if dy != 0 {
                    self.platform
                        .send_pointer(PointerInput::WheelVertical { delta: dy })?;
                }
                if dx != 0 {
                    self.platform
                        .send_pointer(PointerInput::WheelHorizontal { delta: dx })?;
                }
            }
        }
        Ok(())
    }

    /// Map `[0, 65535]` over the selected monitor's pixel box, then
    /// re-normalize against the virtual desktop for the emission.
    fn map_absolute(&self, x: i32, y: i32) -> Result<(i32, i32), InputError> {
        let monitor = self
            .selection
            .get()
            .ok_or(InputError::NoMonitorSelected)?;
        let virtual_rect = self.platform.virtual_desktop_rect()?;

        let x = x.clamp(0, NORMALIZED_MAX);
        let y = y.clamp(0, NORMALIZED_MAX);

        // Rounded scale of `value/65535` over a pixel span.
        let to_pixel = |norm: i32, span: u32| -> i32 {
            ((norm as i64 * (span as i64 - 1) + NORMALIZED_MAX as i64 / 2)
                / NORMALIZED_MAX as i64) as i32
        };
        let pixel_x = monitor.x + to_pixel(x, monitor.width);
        let pixel_y = monitor.y + to_pixel(y, monitor.height);

        let renormalize = |pixel: i32, origin: i32, span: i32| -> i32 {
            if span <= 1 {
                return 0;
            }
            let offset = (pixel - origin).clamp(0, span - 1) as i64;
            ((offset * NORMALIZED_MAX as i64 + (span as i64 - 1) / 2) / (span as i64 - 1)) as i32
        };

        Ok((
            renormalize(pixel_x, virtual_rect.x, virtual_rect.width),
            renormalize(pixel_y, virtual_rect.y, virtual_rect.height),
        ))
    }

    fn emit_keyboard(&self, event: KeyboardEvent) -> Result<(), InputError> {
        match event {
            KeyboardEvent::KeyDown { vk, modifiers } => {
                let mut guard = ModifierGuard::new(&*self.platform);
                for modifier in modifiers.press_order() {
                    guard.press(modifier)?;
                }
                self.platform.send_key(vk, true)?;
                // Held on purpose; the matching key-up releases them.
                guard.disarm();
                Ok(())
            }
            KeyboardEvent::KeyUp { vk, modifiers } => {
                let mut first_error: Option<InputError> = None;
                if let Err(e) = self.platform.send_key(vk, false) {
                    first_error.get_or_insert(e.into());
                }
                for modifier in modifiers.press_order().into_iter().rev() {
                    if let Err(e) = self.platform.send_key(modifier, false) {
                        first_error.get_or_insert(e.into());
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            KeyboardEvent::Text { text, modifiers } => {
                for c in text.chars() {
                    let Some(translation) = self.platform.translate_char(c) else {
                        debug!(character = ?c, "skipping untranslatable character");
                        continue;
                    };

                    let effective = if translation.shift {
                        modifiers.with_shift()
                    } else {
                        modifiers
                    };

                    let mut guard = ModifierGuard::new(&*self.platform);
                    for modifier in effective.press_order() {
                        guard.press(modifier)?;
                    }
                    self.platform.send_key(translation.vk, true)?;
                    self.platform.send_key(translation.vk, false)?;
                    guard.release()?;
                }
                Ok(())
            }
        }
    }
}
