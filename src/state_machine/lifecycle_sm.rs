//! VM lifecycle state machine.
//!
//! ```text
//!            Start              Pause
//! Stopped ─────────► Running ─────────► Paused
//!    ▲                 │ ▲                │
//!    │     Cleanup     │ └──── Resume ────┘
//!    └─────────────────┴──────────────────┘  (Cleanup from either)
//! ```
//!
//! The machine only decides whether an edge exists. Side effects (spawning,
//! monitor sends, persistence) belong to the supervisor, which feeds the
//! machine an event after the effect has been attempted.

use statig::prelude::*;
use tracing::debug;

// ---------------------------------------------------------------------------
// Public state view
// ---------------------------------------------------------------------------

/// Observed lifecycle state of one VM session.
///
/// The discriminants are the numeric codes listeners receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum VmState {
    Stopped = 0,
    Running = 1,
    Paused = 2,
}

impl VmState {
    /// Numeric state code (0 stopped, 1 running, 2 paused).
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Operations a controlling UI may offer in this state.
    pub fn enabled_operations(self) -> &'static [Operation] {
        match self {
            VmState::Stopped => &[Operation::Start, Operation::StartHeadless, Operation::Delete],
            VmState::Running => &[Operation::Pause, Operation::Stop],
            VmState::Paused => &[Operation::Resume, Operation::Stop],
        }
    }

    pub fn allows(self, op: Operation) -> bool {
        self.enabled_operations().contains(&op)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VmState::Stopped => "stopped",
            VmState::Running => "running",
            VmState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// User-facing lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    StartHeadless,
    Pause,
    Resume,
    Stop,
    Delete,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events dispatched to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The engine process was spawned and confirmed alive.
    Started,
    /// The monitor `stop` command was issued.
    Paused,
    /// The monitor `cont` command was issued.
    Resumed,
    /// Cleanup ran: forced stop timeout or the process went away on its own.
    Cleanup,
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Shared storage for the lifecycle machine.
#[derive(Debug, Default)]
pub struct LifecycleMachine {
    vm_name: String,
}

impl LifecycleMachine {
    pub fn new(vm_name: impl Into<String>) -> Self {
        Self { vm_name: vm_name.into() }
    }

    /// Map the generated machine state onto the public [`VmState`].
    pub fn view(state: &State) -> VmState {
        match state {
            State::Stopped {} => VmState::Stopped,
            State::Running {} => VmState::Running,
            State::Paused {} => VmState::Paused,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::stopped()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl LifecycleMachine {
    /// No engine process exists.
    #[state]
    fn stopped(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Started => {
                debug!(target: "lifecycle", vm = %self.vm_name, "stopped -> running");
                Transition(State::running())
            }
            _ => Handled,
        }
    }

    /// The guest is executing.
    #[state]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Paused => {
                debug!(target: "lifecycle", vm = %self.vm_name, "running -> paused");
                Transition(State::paused())
            }
            LifecycleEvent::Cleanup => {
                debug!(target: "lifecycle", vm = %self.vm_name, "running -> stopped");
                Transition(State::stopped())
            }
            _ => Handled,
        }
    }

    /// The guest CPUs are frozen; the process is still alive.
    #[state]
    fn paused(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Resumed => {
                debug!(target: "lifecycle", vm = %self.vm_name, "paused -> running");
                Transition(State::running())
            }
            LifecycleEvent::Cleanup => {
                debug!(target: "lifecycle", vm = %self.vm_name, "paused -> stopped");
                Transition(State::stopped())
            }
            _ => Handled,
        }
    }
}

/// Owned wrapper that keeps the statig machine and exposes [`VmState`].
pub struct Lifecycle {
    machine: statig::blocking::StateMachine<LifecycleMachine>,
}

impl Lifecycle {
    pub fn new(vm_name: impl Into<String>) -> Self {
        Self {
            machine: LifecycleMachine::new(vm_name).state_machine(),
        }
    }

    pub fn state(&self) -> VmState {
        LifecycleMachine::view(self.machine.state())
    }

    /// Feed an event and report whether the state actually changed.
    pub fn apply(&mut self, event: LifecycleEvent) -> bool {
        let before = self.state();
        self.machine.handle(&event);
        before != self.state()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle").field("state", &self.state()).finish()
    }
}
