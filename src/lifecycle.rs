/// Listener lifecycle state machine
///
/// `ServerRuntime` owns the listener state, the reconnect attempt counter and
/// the "one pending timer at most" guard. It performs no I/O: the control
/// loop in `server` feeds it events and acts on the decisions it returns,
/// which keeps every retry rule testable without sockets.
///
/// ```text
/// Stopped -> Starting -> Listening
/// Listening -> Faulted                 (listener error / unexpected close)
/// Faulted -> Reconnecting -> Starting  (after the retry delay)
/// Faulted                              (terminal once the budget is spent)
/// ```

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::ReconnectPolicy;
use crate::error::ModbusError;

/// Listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Listening,
    Faulted,
    Reconnecting,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Listening => "listening",
            ServerState::Faulted => "faulted",
            ServerState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// What started a bind attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTrigger {
    /// Host called `start`
    External,
    /// Reconnect timer fired
    Timer,
}

/// Outcome of a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Arm the reconnect timer with this delay
    Schedule(Duration),
    /// A timer is already armed, do nothing
    AlreadyPending,
    /// Attempt budget spent; stay faulted until restarted from outside
    Exhausted { attempts: u32 },
}

/// Point-in-time view of the runtime, published by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSnapshot {
    pub state: ServerState,
    pub reconnect_attempts: u32,
    pub pending_delay: Option<Duration>,
    pub exhausted: bool,
    pub local_addr: Option<SocketAddr>,
}

impl Default for RuntimeSnapshot {
    fn default() -> Self {
        Self {
            state: ServerState::Stopped,
            reconnect_attempts: 0,
            pending_delay: None,
            exhausted: false,
            local_addr: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerRuntime {
    state: ServerState,
    policy: ReconnectPolicy,
    reconnect_attempts: u32,
    pending_delay: Option<Duration>,
    exhausted: bool,
}

impl ServerRuntime {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ServerState::Stopped,
            policy,
            reconnect_attempts: 0,
            pending_delay: None,
            exhausted: false,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// A reconnect timer is armed
    pub fn is_reconnecting(&self) -> bool {
        self.pending_delay.is_some()
    }

    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending_delay
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Takes effect on the next fault
    pub fn set_policy(&mut self, policy: ReconnectPolicy) {
        self.policy = policy;
    }

    /// Enter `Starting`, superseding any armed timer
    ///
    /// An external start after the budget ran out grants a fresh budget.
    pub fn begin_start(&mut self, trigger: StartTrigger) {
        if trigger == StartTrigger::External && self.exhausted {
            self.reconnect_attempts = 0;
            self.exhausted = false;
        }
        self.pending_delay = None;
        self.state = ServerState::Starting;
    }

    /// The listener is bound
    pub fn bound(&mut self) {
        self.state = ServerState::Listening;
        self.reconnect_attempts = 0;
        self.pending_delay = None;
        self.exhausted = false;
    }

    /// Bind failure or listener error
    pub fn listener_fault(&mut self, error: &ModbusError) -> ReconnectDecision {
        self.state = ServerState::Faulted;
        let delay = self.policy.delay_for(error);
        self.schedule_reconnect(delay)
    }

    /// Listener went away without being asked to
    pub fn listener_closed(&mut self) -> ReconnectDecision {
        if self.is_reconnecting() {
            return ReconnectDecision::AlreadyPending;
        }
        self.state = ServerState::Faulted;
        let delay = Duration::from_millis(self.policy.default_delay_ms);
        self.schedule_reconnect(delay)
    }

    fn schedule_reconnect(&mut self, delay: Duration) -> ReconnectDecision {
        if self.reconnect_attempts >= self.policy.max_attempts {
            self.exhausted = true;
            self.pending_delay = None;
            self.state = ServerState::Faulted;
            return ReconnectDecision::Exhausted {
                attempts: self.reconnect_attempts,
            };
        }
        if self.is_reconnecting() {
            self.state = ServerState::Reconnecting;
            return ReconnectDecision::AlreadyPending;
        }

        self.reconnect_attempts += 1;
        self.pending_delay = Some(delay);
        self.state = ServerState::Reconnecting;
        ReconnectDecision::Schedule(delay)
    }

    /// Listener closed on request; any armed timer is dropped
    pub fn stopped(&mut self) {
        self.state = ServerState::Stopped;
        self.pending_delay = None;
    }

    pub fn snapshot(&self, local_addr: Option<SocketAddr>) -> RuntimeSnapshot {
        RuntimeSnapshot {
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            pending_delay: self.pending_delay,
            exhausted: self.exhausted,
            local_addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_use() -> ModbusError {
        ModbusError::address_in_use("0.0.0.0:502")
    }

    #[test]
    fn test_happy_path() {
        let mut runtime = ServerRuntime::new(ReconnectPolicy::default());
        assert_eq!(runtime.state(), ServerState::Stopped);

        runtime.begin_start(StartTrigger::External);
        assert_eq!(runtime.state(), ServerState::Starting);

        runtime.bound();
        assert_eq!(runtime.state(), ServerState::Listening);
        assert_eq!(runtime.reconnect_attempts(), 0);

        runtime.stopped();
        assert_eq!(runtime.state(), ServerState::Stopped);
    }

    #[test]
    fn test_fault_delays() {
        let mut runtime = ServerRuntime::new(ReconnectPolicy::default());
        runtime.begin_start(StartTrigger::External);
        assert_eq!(
            runtime.listener_fault(&in_use()),
            ReconnectDecision::Schedule(Duration::from_secs(10))
        );
        assert_eq!(runtime.state(), ServerState::Reconnecting);

        runtime.begin_start(StartTrigger::Timer);
        assert_eq!(
            runtime.listener_fault(&ModbusError::io("permission denied")),
            ReconnectDecision::Schedule(Duration::from_secs(5))
        );
        assert_eq!(runtime.reconnect_attempts(), 2);
    }

    #[test]
    fn test_single_pending_timer() {
        let mut runtime = ServerRuntime::new(ReconnectPolicy::default());
        runtime.begin_start(StartTrigger::External);
        runtime.bound();

        assert!(matches!(
            runtime.listener_fault(&ModbusError::connection("accept failed")),
            ReconnectDecision::Schedule(_)
        ));
        assert_eq!(
            runtime.listener_fault(&ModbusError::connection("again")),
            ReconnectDecision::AlreadyPending
        );
        assert_eq!(runtime.listener_closed(), ReconnectDecision::AlreadyPending);
        assert_eq!(runtime.reconnect_attempts(), 1);
        assert_eq!(runtime.pending_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_unexpected_close_uses_default_delay() {
        let mut runtime = ServerRuntime::new(ReconnectPolicy::default());
        runtime.begin_start(StartTrigger::External);
        runtime.bound();
        assert_eq!(
            runtime.listener_closed(),
            ReconnectDecision::Schedule(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_budget_exhausts_after_100_attempts() {
        let mut runtime = ServerRuntime::new(ReconnectPolicy::default());
        runtime.begin_start(StartTrigger::External);

        for attempt in 1..=100 {
            assert_eq!(
                runtime.listener_fault(&in_use()),
                ReconnectDecision::Schedule(Duration::from_secs(10)),
                "attempt {}",
                attempt
            );
            assert_eq!(runtime.reconnect_attempts(), attempt);
            runtime.begin_start(StartTrigger::Timer);
        }

        assert_eq!(
            runtime.listener_fault(&in_use()),
            ReconnectDecision::Exhausted { attempts: 100 }
        );
        assert_eq!(runtime.state(), ServerState::Faulted);
        assert!(!runtime.is_reconnecting());
        assert!(runtime.is_exhausted());

        // Stays terminal
        assert_eq!(
            runtime.listener_closed(),
            ReconnectDecision::Exhausted { attempts: 100 }
        );

        // Manual restart grants a fresh budget
        runtime.begin_start(StartTrigger::External);
        assert_eq!(runtime.reconnect_attempts(), 0);
        assert!(matches!(
            runtime.listener_fault(&in_use()),
            ReconnectDecision::Schedule(_)
        ));
    }

    #[test]
    fn test_bind_success_resets_attempts() {
        let mut runtime = ServerRuntime::new(ReconnectPolicy::default());
        runtime.begin_start(StartTrigger::External);
        runtime.listener_fault(&in_use());
        runtime.begin_start(StartTrigger::Timer);
        runtime.listener_fault(&in_use());
        assert_eq!(runtime.reconnect_attempts(), 2);

        runtime.begin_start(StartTrigger::Timer);
        runtime.bound();
        assert_eq!(runtime.reconnect_attempts(), 0);
        assert_eq!(runtime.snapshot(None).pending_delay, None);
    }

    #[test]
    fn test_stop_cancels_pending() {
        let mut runtime = ServerRuntime::new(ReconnectPolicy::default());
        runtime.begin_start(StartTrigger::External);
        runtime.listener_fault(&in_use());
        assert!(runtime.is_reconnecting());

        runtime.stopped();
        assert!(!runtime.is_reconnecting());
        assert_eq!(runtime.state(), ServerState::Stopped);
    }
}
