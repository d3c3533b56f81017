//! # Retry/Backoff Controller
//!
//! Maps a classified failure to what the poll loop does next: how long to wait,
//! whether to rebuild the session, and whether queued writes may cut the wait
//! short.
//!
//! ```text
//! ErrorKind                      action      timer      queue drain
//! ─────────────────────────────  ──────────  ─────────  ───────────
//! BadCredentials/RouteNotFound/  Exit        -          -
//!   RedirectLimit
//! ConnectFailed/AuthFailed       Reconnect   offline    suppressed
//! ConnectionClosed               Reconnect   conn_err   suppressed
//! PingTimeout                    Reconnect   min        suppressed
//! Unclassified (< N in a row)    Continue    -          -
//! Unclassified (N-th in a row)   Reconnect   conn_err   suppressed
//! ```
//!
//! While a reboot is pending every reconnect uses the `reboot` timer instead,
//! since the device is expected to vanish for a while.

use crate::config::TimerConfig;
use crate::session::ErrorKind;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    Offline,
    ConnErr,
    Reboot,
    Min,
    Live,
}

impl Timer {
    pub fn name(&self) -> &'static str {
        match self {
            Timer::Offline => "offline",
            Timer::ConnErr => "conn_err",
            Timer::Reboot => "reboot",
            Timer::Min => "min",
            Timer::Live => "live",
        }
    }

    pub fn duration(&self, timers: &TimerConfig) -> Duration {
        let secs = match self {
            Timer::Offline => timers.offline,
            Timer::ConnErr => timers.conn_err,
            Timer::Reboot => timers.reboot,
            Timer::Min => timers.min,
            Timer::Live => timers.live,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for Timer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "timer_{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Keep the session; the failed read simply yields no data this cycle
    Continue,
    /// Drop the session, wait, build a new one
    Reconnect,
    /// Unrecoverable; terminate the process
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub kind: ErrorKind,
    pub action: RetryAction,
    pub timer: Option<Timer>,
    pub wait: Duration,
    pub queue_drain_suppressed: bool,
}

impl RetryDecision {
    fn exit(kind: ErrorKind) -> Self {
        Self {
            kind,
            action: RetryAction::Exit,
            timer: None,
            wait: Duration::ZERO,
            queue_drain_suppressed: true,
        }
    }

    fn carry_on(kind: ErrorKind) -> Self {
        Self {
            kind,
            action: RetryAction::Continue,
            timer: None,
            wait: Duration::ZERO,
            queue_drain_suppressed: false,
        }
    }
}

/// Device-session retry policy plus its consecutive-failure counter.
#[derive(Debug, Clone)]
pub struct RetryController {
    consecutive_failures: u32,
    threshold: u32,
    timers: TimerConfig,
}

impl RetryController {
    pub fn new(timers: &TimerConfig) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: timers.attempt_restart.max(1),
            timers: timers.clone(),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Decides how to react to a failed device operation.
    pub fn on_failure(&mut self, kind: ErrorKind, reboot_pending: bool) -> RetryDecision {
        if kind.is_fatal() {
            error!("Unrecoverable device failure: {:?}", kind);
            return RetryDecision::exit(kind);
        }

        let timer = match kind {
            ErrorKind::ConnectFailed | ErrorKind::AuthFailed => Timer::Offline,
            ErrorKind::ConnectionClosed => Timer::ConnErr,
            ErrorKind::PingTimeout => Timer::Min,
            ErrorKind::Unclassified => {
                self.consecutive_failures += 1;
                if self.consecutive_failures < self.threshold {
                    warn!(
                        "Non breaking error ({}/{}), continuing",
                        self.consecutive_failures, self.threshold
                    );
                    return RetryDecision::carry_on(kind);
                }
                warn!(
                    "Too many consecutive failures: {}",
                    self.consecutive_failures
                );
                Timer::ConnErr
            }
            ErrorKind::BadCredentials | ErrorKind::RouteNotFound | ErrorKind::RedirectLimit => {
                return RetryDecision::exit(kind)
            }
        };

        // a rebuilt session starts counting from zero
        self.consecutive_failures = 0;
        let timer = if reboot_pending { Timer::Reboot } else { timer };
        let wait = timer.duration(&self.timers);
        info!("{:?}: waiting {} ({:?}) and reconnecting", kind, timer, wait);
        RetryDecision {
            kind,
            action: RetryAction::Reconnect,
            timer: Some(timer),
            wait,
            queue_drain_suppressed: true,
        }
    }

    /// Decision for the independent bus track; never touches the device counter.
    pub fn bus_decision(&self) -> RetryDecision {
        let wait = Timer::Offline.duration(&self.timers);
        RetryDecision {
            kind: ErrorKind::ConnectFailed,
            action: RetryAction::Reconnect,
            timer: Some(Timer::Offline),
            wait,
            queue_drain_suppressed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> RetryController {
        RetryController::new(&TimerConfig::default())
    }

    #[test]
    fn escalates_after_exactly_n_unclassified_failures() {
        let mut retry = controller();
        for n in 1..3 {
            let decision = retry.on_failure(ErrorKind::Unclassified, false);
            assert_eq!(decision.action, RetryAction::Continue);
            assert_eq!(retry.consecutive_failures(), n);
        }
        let decision = retry.on_failure(ErrorKind::Unclassified, false);
        assert_eq!(decision.action, RetryAction::Reconnect);
        assert_eq!(decision.timer, Some(Timer::ConnErr));
        assert_eq!(decision.wait, Duration::from_secs(10));
        assert!(decision.queue_drain_suppressed);
        assert_eq!(retry.consecutive_failures(), 0);
    }

    #[test]
    fn success_resets_counter() {
        let mut retry = controller();
        retry.on_failure(ErrorKind::Unclassified, false);
        retry.on_failure(ErrorKind::Unclassified, false);
        retry.record_success();
        assert_eq!(retry.consecutive_failures(), 0);
        let decision = retry.on_failure(ErrorKind::Unclassified, false);
        assert_eq!(decision.action, RetryAction::Continue);
    }

    #[test]
    fn timers_per_kind() {
        let mut retry = controller();
        let offline = retry.on_failure(ErrorKind::ConnectFailed, false);
        assert_eq!(offline.timer, Some(Timer::Offline));
        assert_eq!(offline.wait, Duration::from_secs(600));
        assert_eq!(
            retry.on_failure(ErrorKind::AuthFailed, false).timer,
            Some(Timer::Offline)
        );
        assert_eq!(
            retry.on_failure(ErrorKind::ConnectionClosed, false).timer,
            Some(Timer::ConnErr)
        );
        let ping = retry.on_failure(ErrorKind::PingTimeout, false);
        assert_eq!(ping.timer, Some(Timer::Min));
        assert_eq!(ping.action, RetryAction::Reconnect);
    }

    #[test]
    fn reboot_replaces_connection_error_timer() {
        let mut retry = controller();
        let decision = retry.on_failure(ErrorKind::ConnectionClosed, true);
        assert_eq!(decision.timer, Some(Timer::Reboot));
        assert_eq!(decision.wait, Duration::from_secs(160));
        assert!(decision.queue_drain_suppressed);
    }

    #[test]
    fn fatal_kinds_exit() {
        let mut retry = controller();
        for kind in [
            ErrorKind::BadCredentials,
            ErrorKind::RouteNotFound,
            ErrorKind::RedirectLimit,
        ] {
            assert_eq!(retry.on_failure(kind, false).action, RetryAction::Exit);
        }
    }

    #[test]
    fn bus_track_leaves_device_counter_alone() {
        let mut retry = controller();
        retry.on_failure(ErrorKind::Unclassified, false);
        let bus = retry.bus_decision();
        assert_eq!(bus.timer, Some(Timer::Offline));
        assert_eq!(retry.consecutive_failures(), 1);
    }
}
