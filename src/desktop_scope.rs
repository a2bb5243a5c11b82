//! Desktop/session context switching.
//!
//! `run_scoped` executes a block with the calling thread impersonating the
//! active interactive user and attached to that session's input desktop,
//! releasing both in LIFO order on every exit path. The scope is best
//! effort: when acquisition fails the block still runs in the agent's own
//! context, with a warning.

use std::cell::Cell;

use tracing::{debug, warn};

use crate::platform::{Platform, ScopeToken};
use crate::session_state::SessionSnapshot;

thread_local! {
    /// Scope nesting depth for this thread. Re-entry reuses the already
    /// attached desktop instead of reopening it.
    static SCOPE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// An entered desktop scope. Dropping it releases the impersonation and
/// desktop switch acquired on entry; nested entries release nothing.
pub struct DesktopScope {
    token: Option<Box<dyn ScopeToken>>,
}

impl DesktopScope {
    /// Enter a scope for the session in `snapshot` (or a fresh query when
    /// absent). Never fails: an unacquirable scope is returned empty.
    pub fn enter(platform: &dyn Platform, snapshot: Option<SessionSnapshot>) -> Self {
        let depth = SCOPE_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth
        });

        if depth > 0 {
            // Already attached on this thread; impersonation outlives the
            // inner scope until the outermost one exits.
            return Self { token: None };
        }

        let session_id = match snapshot {
            Some(snapshot) => snapshot.session_id,
            None => platform.active_console_session().unwrap_or_else(|e| {
                debug!("session query failed while entering scope: {}", e);
                None
            }),
        };

        let token = match session_id {
            Some(session_id) => match platform.attach_input_desktop(session_id) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(session_id, "desktop scope acquisition failed: {}", e);
                    None
                }
            },
            None => {
                warn!("no interactive session, running in agent context");
                None
            }
        };

        Self { token }
    }

    /// Whether this entry actually acquired the impersonation + desktop.
    pub fn attached(&self) -> bool {
        self.token.is_some()
    }
}

impl Drop for DesktopScope {
    fn drop(&mut self) {
        // Token release (desktop restore, impersonation revert) happens in
        // the platform's LIFO drop; then the depth unwinds.
        self.token.take();
        SCOPE_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Run `work` inside a desktop scope for the given (or current) session.
pub fn run_scoped<T>(
    platform: &dyn Platform,
    snapshot: Option<SessionSnapshot>,
    work: impl FnOnce() -> T,
) -> T {
    let _scope = DesktopScope::enter(platform, snapshot);
    work()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::headless::HeadlessPlatform;
    use crate::session_state::DesktopMode;
    use std::sync::Arc;

    fn snapshot(session_id: u32) -> SessionSnapshot {
        SessionSnapshot {
            session_id: Some(session_id),
            mode: DesktopMode::Desktop,
        }
    }

    #[test]
    fn scope_wraps_work_and_releases() {
        let platform = Arc::new(HeadlessPlatform::new());
        let result = run_scoped(&*platform, Some(snapshot(1)), || {
            assert_eq!(platform.active_scope_count(), 1);
            42
        });
        assert_eq!(result, 42);
        assert_eq!(platform.active_scope_count(), 0);
    }

    #[test]
    fn nested_scopes_reuse_the_outer_attachment() {
        let platform = Arc::new(HeadlessPlatform::new());
        run_scoped(&*platform, Some(snapshot(1)), || {
            run_scoped(&*platform, Some(snapshot(1)), || {
                assert_eq!(platform.active_scope_count(), 1);
            });
            // Outer attachment still live after the inner exit.
            assert_eq!(platform.active_scope_count(), 1);
        });
        assert_eq!(platform.active_scope_count(), 0);
        assert_eq!(platform.scopes_opened(), 1);
    }

    #[test]
    fn work_runs_when_acquisition_fails() {
        let platform = Arc::new(HeadlessPlatform::new());
        platform.set_session(None);
        let ran = run_scoped(&*platform, None, || true);
        assert!(ran);
        assert_eq!(platform.active_scope_count(), 0);
    }

    #[test]
    fn scope_releases_on_panic() {
        let platform = Arc::new(HeadlessPlatform::new());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_scoped(&*platform, Some(snapshot(1)), || panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(platform.active_scope_count(), 0);

        // The thread-local depth unwound too: a fresh scope reattaches.
        run_scoped(&*platform, Some(snapshot(1)), || {
            assert_eq!(platform.active_scope_count(), 1);
        });
    }

    #[test]
    fn threads_hold_independent_scopes() {
        let platform = Arc::new(HeadlessPlatform::new());
        let inner = Arc::clone(&platform);
        run_scoped(&*platform, Some(snapshot(1)), || {
            let handle = std::thread::spawn(move || {
                run_scoped(&*inner, Some(snapshot(1)), || inner.active_scope_count())
            });
            assert_eq!(handle.join().unwrap(), 2);
        });
        assert_eq!(platform.active_scope_count(), 0);
    }
}
