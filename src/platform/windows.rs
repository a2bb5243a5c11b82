//! Win32 implementation of the platform primitives.
//!
//! Runs inside a LocalSystem service in Session 0, so every desktop-facing
//! call assumes nothing about the process's own window station:
//! - Session queries go through the WTS API
//! - Desktop attachment duplicates the session user's token and switches
//!   the calling thread to the input desktop
//! - Capture uses GDI (device context + BitBlt), which keeps working on
//!   the Winlogon and secure desktops where duplication APIs give out
//! - Input goes through `SendInput` with absolute/virtual-desktop flags

use std::ffi::c_void;

use tracing::{debug, warn};
use windows::core::{PCWSTR, PCSTR};
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, HLOCAL, HWND, LPARAM, LocalFree, RECT,
};
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleBitmap, CreateCompatibleDC, CreateDCW, DeleteDC, DeleteObject,
    EnumDisplayDevicesW, EnumDisplayMonitors, EnumDisplaySettingsW, GetDC, GetDIBits,
    GetMonitorInfoW, GetWindowDC, ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB,
    DIB_RGB_COLORS, DISPLAY_DEVICEW, ENUM_CURRENT_SETTINGS, HBITMAP, HDC, HGDIOBJ, HMONITOR,
    MONITORINFOEXW, SRCCOPY,
};
use windows::Win32::Security::Cryptography::{CryptUnprotectData, CRYPT_INTEGER_BLOB};
use windows::Win32::Security::{
    DuplicateTokenEx, RevertToSelf, SecurityImpersonation, SetThreadToken, TokenImpersonation,
    TOKEN_DUPLICATE, TOKEN_IMPERSONATE, TOKEN_QUERY,
};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};
use windows::Win32::System::RemoteDesktop::{
    WTSEnumerateSessionsW, WTSFreeMemory, WTSGetActiveConsoleSessionId,
    WTSQuerySessionInformationW, WTSQueryUserToken, WTSUserName, WTS_CURRENT_SERVER_HANDLE,
    WTS_SESSION_INFOW,
};
use windows::Win32::System::StationsAndDesktops::{
    CloseDesktop, GetThreadDesktop, GetUserObjectInformationW, OpenDesktopW, OpenInputDesktop,
    SetThreadDesktop, DESKTOP_CONTROL_FLAGS, DESKTOP_READOBJECTS, DESKTOP_SWITCHDESKTOP,
    DESKTOP_WRITEOBJECTS, HDESK, UOI_NAME,
};
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::Input::KeyboardAndMouse::{
    SendInput, VkKeyScanW, INPUT, INPUT_0, INPUT_KEYBOARD, INPUT_MOUSE, KEYBDINPUT,
    KEYBD_EVENT_FLAGS, KEYEVENTF_KEYUP, MOUSEEVENTF_ABSOLUTE, MOUSEEVENTF_HWHEEL,
    MOUSEEVENTF_LEFTDOWN, MOUSEEVENTF_LEFTUP, MOUSEEVENTF_MIDDLEDOWN, MOUSEEVENTF_MIDDLEUP,
    MOUSEEVENTF_MOVE, MOUSEEVENTF_RIGHTDOWN, MOUSEEVENTF_RIGHTUP, MOUSEEVENTF_VIRTUALDESK,
    MOUSEEVENTF_WHEEL, MOUSEINPUT, VIRTUAL_KEY,
};
use windows::Win32::UI::WindowsAndMessaging::{
    GetDesktopWindow, GetSystemMetrics, SetCursorPos, SM_CXVIRTUALSCREEN, SM_CYVIRTUALSCREEN,
    SM_XVIRTUALSCREEN, SM_YVIRTUALSCREEN,
};

use super::{
    CaptureStrategy, CaptureSurface, DisplayDevice, KeyTranslation, Platform, PlatformError,
    PointerButton, PointerInput, PowerAction, Rect, ScopeToken, NO_SESSION,
};

pub struct WindowsPlatform;

impl WindowsPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn last_error(call: &'static str) -> PlatformError {
    let code = unsafe { GetLastError() };
    PlatformError::api(call, format!("{:?}", code))
}

/// Decode a NUL-terminated UTF-16 buffer.
fn wide_to_string(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}

/// Acquired impersonation + desktop switch, released LIFO on drop.
struct WindowsScope {
    token: Option<HANDLE>,
    opened_desktop: Option<HDESK>,
    prior_desktop: Option<HDESK>,
}

impl ScopeToken for WindowsScope {}

impl Drop for WindowsScope {
    fn drop(&mut self) {
        unsafe {
            if let Some(prior) = self.prior_desktop.take() {
                if let Err(e) = SetThreadDesktop(prior) {
                    warn!("failed to restore prior desktop: {:?}", e);
                }
            }
            if let Some(opened) = self.opened_desktop.take() {
                let _ = CloseDesktop(opened);
            }
            if let Some(token) = self.token.take() {
                if let Err(e) = RevertToSelf() {
                    warn!("RevertToSelf failed: {:?}", e);
                }
                let _ = CloseHandle(token);
            }
        }
    }
}

/// Open the desktop that should receive the switch, walking the fallback
/// chain: input desktop, then the named interactive desktop, then the
/// secure (lock/login) desktop.
fn open_target_desktop() -> Result<HDESK, PlatformError> {
    let access = DESKTOP_READOBJECTS | DESKTOP_SWITCHDESKTOP | DESKTOP_WRITEOBJECTS;

    unsafe {
        if let Ok(desktop) = OpenInputDesktop(DESKTOP_CONTROL_FLAGS(0), false, access) {
            return Ok(desktop);
        }

        let default_name: Vec<u16> = "Default".encode_utf16().chain(std::iter::once(0)).collect();
        if let Ok(desktop) = OpenDesktopW(
            PCWSTR(default_name.as_ptr()),
            DESKTOP_CONTROL_FLAGS(0),
            false,
            access,
        ) {
            debug!("input desktop unavailable, fell back to Default");
            return Ok(desktop);
        }

        let winlogon_name: Vec<u16> = "Winlogon"
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        OpenDesktopW(
            PCWSTR(winlogon_name.as_ptr()),
            DESKTOP_CONTROL_FLAGS(0),
            false,
            access,
        )
        .map_err(|e| PlatformError::api("OpenDesktopW(Winlogon)", e.to_string()))
    }
}

/// GDI capture target: memory DC + compatible bitmap of fixed (w, h).
struct GdiSurface {
    mem_dc: HDC,
    bitmap: HBITMAP,
    old_bitmap: HGDIOBJ,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

// The surface is only ever touched by the capture loop thread.
unsafe impl Send for GdiSurface {}

impl GdiSurface {
    fn new(width: u32, height: u32) -> Result<Self, PlatformError> {
        unsafe {
            let screen_dc = GetDC(None);
            if screen_dc.is_invalid() {
                return Err(last_error("GetDC"));
            }

            let mem_dc = CreateCompatibleDC(screen_dc);
            if mem_dc.is_invalid() {
                ReleaseDC(None, screen_dc);
                return Err(last_error("CreateCompatibleDC"));
            }

            let bitmap = CreateCompatibleBitmap(screen_dc, width as i32, height as i32);
            if bitmap.is_invalid() {
                let _ = DeleteDC(mem_dc);
                ReleaseDC(None, screen_dc);
                return Err(last_error("CreateCompatibleBitmap"));
            }

            let old_bitmap = SelectObject(mem_dc, bitmap);
            ReleaseDC(None, screen_dc);

            Ok(Self {
                mem_dc,
                bitmap,
                old_bitmap,
                width,
                height,
                pixels: vec![0u8; (width * height * 4) as usize],
            })
        }
    }

    /// Read the bitmap back as top-down 32-bit BGRA.
    fn read_bits(&mut self) -> Result<(), PlatformError> {
        let mut bi = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: self.width as i32,
                biHeight: -(self.height as i32), // Negative for top-down
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0 as u32,
                ..Default::default()
            },
            ..Default::default()
        };

        let result = unsafe {
            GetDIBits(
                self.mem_dc,
                self.bitmap,
                0,
                self.height,
                Some(self.pixels.as_mut_ptr() as *mut c_void),
                &mut bi,
                DIB_RGB_COLORS,
            )
        };

        if result == 0 {
            return Err(last_error("GetDIBits"));
        }
        Ok(())
    }
}

impl Drop for GdiSurface {
    fn drop(&mut self) {
        unsafe {
            SelectObject(self.mem_dc, self.old_bitmap);
            let _ = DeleteObject(self.bitmap);
            let _ = DeleteDC(self.mem_dc);
        }
    }
}

impl CaptureSurface for GdiSurface {
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
        unsafe {
            // Acquire the source DC for the strategy. The first two depend
            // on the caller having already switched the thread's desktop.
            let (src_dc, release): (HDC, fn(HDC)) = match strategy {
                CaptureStrategy::DesktopWindowDc => {
                    let desktop_hwnd = GetDesktopWindow();
                    let dc = GetWindowDC(Some(desktop_hwnd));
                    if dc.is_invalid() {
                        return Err(last_error("GetWindowDC"));
                    }
                    (dc, |dc| unsafe {
                        ReleaseDC(Some(GetDesktopWindow()), dc);
                    })
                }
                CaptureStrategy::SwitchedDesktopBlit => {
                    let dc = GetDC(None);
                    if dc.is_invalid() {
                        return Err(last_error("GetDC"));
                    }
                    (dc, |dc| unsafe {
                        ReleaseDC(None, dc);
                    })
                }
                CaptureStrategy::ScreenSurface => {
                    let display: Vec<u16> =
                        "DISPLAY".encode_utf16().chain(std::iter::once(0)).collect();
                    let dc = CreateDCW(PCWSTR(display.as_ptr()), PCWSTR::null(), PCWSTR::null(), None);
                    if dc.is_invalid() {
                        return Err(last_error("CreateDCW"));
                    }
                    (dc, |dc| unsafe {
                        let _ = DeleteDC(dc);
                    })
                }
            };

            let blit = BitBlt(
                self.mem_dc,
                0,
                0,
                self.width as i32,
                self.height as i32,
                src_dc,
                src_x,
                src_y,
                SRCCOPY,
            );
            release(src_dc);
            blit.map_err(|e| PlatformError::api("BitBlt", e.to_string()))?;
        }

        self.read_bits()?;
        Ok(&self.pixels)
    }
}

/// Query the username of a session; empty when no user is logged on.
fn session_user_name(session_id: u32) -> Option<String> {
    unsafe {
        let mut buffer = PCWSTR::null();
        let mut bytes_returned: u32 = 0;

        WTSQuerySessionInformationW(
            WTS_CURRENT_SERVER_HANDLE,
            session_id,
            WTSUserName,
            &mut buffer as *mut _ as *mut _,
            &mut bytes_returned,
        )
        .ok()?;

        if buffer.is_null() {
            return None;
        }

        let len = (bytes_returned as usize / 2).saturating_sub(1);
        let slice = std::slice::from_raw_parts(buffer.0, len);
        let name = String::from_utf16_lossy(slice);
        WTSFreeMemory(buffer.0 as *mut c_void);

        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

impl Platform for WindowsPlatform {
    fn active_console_session(&self) -> Result<Option<u32>, PlatformError> {
        let session_id = unsafe { WTSGetActiveConsoleSessionId() };
        if session_id == NO_SESSION {
            Ok(None)
        } else {
            Ok(Some(session_id))
        }
    }

    fn input_desktop_name(&self) -> Result<String, PlatformError> {
        unsafe {
            let desktop = OpenInputDesktop(
                DESKTOP_CONTROL_FLAGS(0),
                false,
                DESKTOP_READOBJECTS,
            )
            .map_err(|e| PlatformError::api("OpenInputDesktop", e.to_string()))?;

            let mut name_buffer = vec![0u16; 256];
            let mut needed_size: u32 = 0;

            let result = GetUserObjectInformationW(
                HANDLE(desktop.0),
                UOI_NAME,
                Some(name_buffer.as_mut_ptr() as *mut c_void),
                (name_buffer.len() * 2) as u32,
                Some(&mut needed_size),
            );
            let _ = CloseDesktop(desktop);

            result.map_err(|e| PlatformError::api("GetUserObjectInformationW", e.to_string()))?;
            Ok(wide_to_string(&name_buffer))
        }
    }

    fn interactive_user_present(&self) -> Result<bool, PlatformError> {
        // Any session with a logged-on user counts, not just the console
        // session: a locked console with a disconnected RDP user behind it
        // is still "locked", not the login screen.
        unsafe {
            let mut sessions: *mut WTS_SESSION_INFOW = std::ptr::null_mut();
            let mut count: u32 = 0;
            WTSEnumerateSessionsW(WTS_CURRENT_SERVER_HANDLE, 0, 1, &mut sessions, &mut count)
                .map_err(|e| PlatformError::api("WTSEnumerateSessionsW", e.to_string()))?;

            let list = std::slice::from_raw_parts(sessions, count as usize);
            let present = list
                .iter()
                .any(|session| session_user_name(session.SessionId).is_some());
            WTSFreeMemory(sessions as *mut c_void);
            Ok(present)
        }
    }

    fn attach_input_desktop(&self, session_id: u32) -> Result<Box<dyn ScopeToken>, PlatformError> {
        unsafe {
            // Primary token of the session's user, duplicated down to an
            // impersonation token with only the rights the scope needs.
            let mut primary = HANDLE::default();
            WTSQueryUserToken(session_id, &mut primary)
                .map_err(|e| PlatformError::api("WTSQueryUserToken", e.to_string()))?;

            let mut impersonation = HANDLE::default();
            let duplicated = DuplicateTokenEx(
                primary,
                TOKEN_QUERY | TOKEN_IMPERSONATE | TOKEN_DUPLICATE,
                None,
                SecurityImpersonation,
                TokenImpersonation,
                &mut impersonation,
            );
            let _ = CloseHandle(primary);
            duplicated.map_err(|e| PlatformError::api("DuplicateTokenEx", e.to_string()))?;

            if let Err(e) = SetThreadToken(None, impersonation) {
                let _ = CloseHandle(impersonation);
                return Err(PlatformError::api("SetThreadToken", e.to_string()));
            }

            let mut scope = WindowsScope {
                token: Some(impersonation),
                opened_desktop: None,
                prior_desktop: None,
            };

            let desktop = open_target_desktop()?;
            let prior = GetThreadDesktop(GetCurrentThreadId())
                .map_err(|e| PlatformError::api("GetThreadDesktop", e.to_string()))?;

            if let Err(e) = SetThreadDesktop(desktop) {
                let _ = CloseDesktop(desktop);
                // Scope drop reverts the impersonation.
                return Err(PlatformError::api("SetThreadDesktop", e.to_string()));
            }

            scope.opened_desktop = Some(desktop);
            scope.prior_desktop = Some(prior);
            Ok(Box::new(scope))
        }
    }

    fn enumerate_display_devices(&self) -> Result<Vec<DisplayDevice>, PlatformError> {
        const DISPLAY_DEVICE_ATTACHED_TO_DESKTOP: u32 = 0x0000_0001;
        const DISPLAY_DEVICE_PRIMARY_DEVICE: u32 = 0x0000_0004;

        let mut displays = Vec::new();
        let mut index = 0u32;

        loop {
            let mut device = DISPLAY_DEVICEW {
                cb: std::mem::size_of::<DISPLAY_DEVICEW>() as u32,
                ..Default::default()
            };

            let found =
                unsafe { EnumDisplayDevicesW(PCWSTR::null(), index, &mut device, 0) }.as_bool();
            if !found {
                break;
            }
            index += 1;

            if device.StateFlags & DISPLAY_DEVICE_ATTACHED_TO_DESKTOP == 0 {
                continue;
            }

            let device_name = wide_to_string(&device.DeviceName);
            let friendly_name = wide_to_string(&device.DeviceString);

            // Current mode gives position and size in the virtual desktop.
            let mut devmode = windows::Win32::Graphics::Gdi::DEVMODEW {
                dmSize: std::mem::size_of::<windows::Win32::Graphics::Gdi::DEVMODEW>() as u16,
                ..Default::default()
            };
            let has_mode = unsafe {
                EnumDisplaySettingsW(
                    PCWSTR(device.DeviceName.as_ptr()),
                    ENUM_CURRENT_SETTINGS,
                    &mut devmode,
                )
            }
            .as_bool();
            if !has_mode {
                continue;
            }

            let position = unsafe { devmode.Anonymous1.Anonymous2.dmPosition };

            displays.push(DisplayDevice {
                device_name,
                friendly_name,
                x: position.x,
                y: position.y,
                width: devmode.dmPelsWidth,
                height: devmode.dmPelsHeight,
                primary: device.StateFlags & DISPLAY_DEVICE_PRIMARY_DEVICE != 0,
            });
        }

        Ok(displays)
    }

    fn enumerate_display_monitors(&self) -> Result<Vec<DisplayDevice>, PlatformError> {
        const MONITORINFOF_PRIMARY: u32 = 0x0000_0001;

        let mut displays: Vec<DisplayDevice> = Vec::new();

        unsafe extern "system" fn enum_monitor_callback(
            monitor: HMONITOR,
            _hdc: HDC,
            _rect: *mut RECT,
            data: LPARAM,
        ) -> windows::Win32::Foundation::BOOL {
            let displays = &mut *(data.0 as *mut Vec<DisplayDevice>);

            let mut info: MONITORINFOEXW = std::mem::zeroed();
            info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;

            if GetMonitorInfoW(monitor, &mut info.monitorInfo as *mut _).as_bool() {
                let rect = info.monitorInfo.rcMonitor;
                displays.push(DisplayDevice {
                    device_name: wide_to_string(&info.szDevice),
                    friendly_name: wide_to_string(&info.szDevice),
                    x: rect.left,
                    y: rect.top,
                    width: (rect.right - rect.left) as u32,
                    height: (rect.bottom - rect.top) as u32,
                    primary: info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY != 0,
                });
            }

            windows::Win32::Foundation::BOOL(1) // Continue enumeration
        }

        let result = unsafe {
            EnumDisplayMonitors(
                None,
                None,
                Some(enum_monitor_callback),
                LPARAM(&mut displays as *mut _ as isize),
            )
        };
        if !result.as_bool() {
            return Err(last_error("EnumDisplayMonitors"));
        }

        Ok(displays)
    }

    fn virtual_desktop_rect(&self) -> Result<Rect, PlatformError> {
        unsafe {
            Ok(Rect {
                x: GetSystemMetrics(SM_XVIRTUALSCREEN),
                y: GetSystemMetrics(SM_YVIRTUALSCREEN),
                width: GetSystemMetrics(SM_CXVIRTUALSCREEN),
                height: GetSystemMetrics(SM_CYVIRTUALSCREEN),
            })
        }
    }

    fn create_capture_surface(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn CaptureSurface>, PlatformError> {
        if width == 0 || height == 0 {
            return Err(PlatformError::OutOfBounds);
        }
        Ok(Box::new(GdiSurface::new(width, height)?))
    }

    fn send_pointer(&self, input: PointerInput) -> Result<(), PlatformError> {
        let mi = match input {
            PointerInput::MoveRelative { dx, dy } => MOUSEINPUT {
                dx,
                dy,
                mouseData: 0,
                dwFlags: MOUSEEVENTF_MOVE,
                time: 0,
                dwExtraInfo: 0,
            },
            PointerInput::MoveAbsoluteVirtual { norm_x, norm_y } => MOUSEINPUT {
                dx: norm_x,
                dy: norm_y,
                mouseData: 0,
                dwFlags: MOUSEEVENTF_MOVE | MOUSEEVENTF_ABSOLUTE | MOUSEEVENTF_VIRTUALDESK,
                time: 0,
                dwExtraInfo: 0,
            },
            PointerInput::Button { button, pressed } => {
                let flags = match (button, pressed) {
                    (PointerButton::Left, true) => MOUSEEVENTF_LEFTDOWN,
                    (PointerButton::Left, false) => MOUSEEVENTF_LEFTUP,
                    (PointerButton::Right, true) => MOUSEEVENTF_RIGHTDOWN,
                    (PointerButton::Right, false) => MOUSEEVENTF_RIGHTUP,
                    (PointerButton::Middle, true) => MOUSEEVENTF_MIDDLEDOWN,
                    (PointerButton::Middle, false) => MOUSEEVENTF_MIDDLEUP,
                };
                MOUSEINPUT {
                    dx: 0,
                    dy: 0,
                    mouseData: 0,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                }
            }
            PointerInput::WheelVertical { delta } => MOUSEINPUT {
                dx: 0,
                dy: 0,
                mouseData: delta as u32,
                dwFlags: MOUSEEVENTF_WHEEL,
                time: 0,
                dwExtraInfo: 0,
            },
            PointerInput::WheelHorizontal { delta } => MOUSEINPUT {
                dx: 0,
                dy: 0,
                mouseData: delta as u32,
                dwFlags: MOUSEEVENTF_HWHEEL,
                time: 0,
                dwExtraInfo: 0,
            },
        };

        let event = INPUT {
            r#type: INPUT_MOUSE,
            Anonymous: INPUT_0 { mi },
        };

        let sent = unsafe { SendInput(&[event], std::mem::size_of::<INPUT>() as i32) };
        if sent == 0 {
            return Err(last_error("SendInput"));
        }
        Ok(())
    }

    fn send_key(&self, vk: u16, pressed: bool) -> Result<(), PlatformError> {
        let mut flags = KEYBD_EVENT_FLAGS(0);
        if !pressed {
            flags |= KEYEVENTF_KEYUP;
        }

        let event = INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT {
                    wVk: VIRTUAL_KEY(vk),
                    wScan: 0,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: 0,
                },
            },
        };

        let sent = unsafe { SendInput(&[event], std::mem::size_of::<INPUT>() as i32) };
        if sent == 0 {
            return Err(last_error("SendInput"));
        }
        Ok(())
    }

    fn translate_char(&self, c: char) -> Option<KeyTranslation> {
        let mut utf16 = [0u16; 2];
        let encoded = c.encode_utf16(&mut utf16);
        if encoded.len() != 1 {
            return None;
        }

        let scan = unsafe { VkKeyScanW(encoded[0]) };
        if scan == -1 {
            return None;
        }

        let vk = (scan & 0xFF) as u16;
        let shift = scan & 0x0100 != 0;
        Some(KeyTranslation { vk, shift })
    }

    fn warp_cursor(&self, x: i32, y: i32) -> Result<(), PlatformError> {
        unsafe { SetCursorPos(x, y) }
            .map_err(|e| PlatformError::api("SetCursorPos", e.to_string()))
    }

    fn send_secure_attention(&self) -> Result<(), PlatformError> {
        // SendSAS requires Session 0 and the TCB privilege, which the
        // service context provides. sas.dll is loaded lazily.
        unsafe {
            let sas_dll = LoadLibraryA(PCSTR(b"sas.dll\0".as_ptr()))
                .map_err(|e| PlatformError::api("LoadLibraryA(sas.dll)", e.to_string()))?;
            let send_sas = GetProcAddress(sas_dll, PCSTR(b"SendSAS\0".as_ptr()))
                .ok_or_else(|| PlatformError::api("GetProcAddress", "SendSAS not found"))?;

            // SendSAS(BOOL AsUser); FALSE = send as service
            let send_sas_fn: extern "system" fn(i32) = std::mem::transmute(send_sas);
            send_sas_fn(0);
        }
        Ok(())
    }

    fn unprotect_secret(&self, blob: &[u8]) -> Result<Vec<u8>, PlatformError> {
        unsafe {
            let input = CRYPT_INTEGER_BLOB {
                cbData: blob.len() as u32,
                pbData: blob.as_ptr() as *mut u8,
            };
            let mut output = CRYPT_INTEGER_BLOB::default();

            CryptUnprotectData(&input, None, None, None, None, 0, &mut output)
                .map_err(|e| PlatformError::api("CryptUnprotectData", e.to_string()))?;

            let bytes =
                std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();
            let _ = LocalFree(HLOCAL(output.pbData as *mut c_void));
            Ok(bytes)
        }
    }

    fn power_action(&self, action: PowerAction) -> Result<(), PlatformError> {
        let flag = match action {
            PowerAction::Restart => "/r",
            PowerAction::Shutdown => "/s",
        };

        std::process::Command::new("shutdown")
            .args([flag, "/t", "5"])
            .spawn()
            .map_err(|e| PlatformError::api("shutdown", e.to_string()))?;
        Ok(())
    }
}
