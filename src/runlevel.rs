//! Runlevel state machine coordinating bring-up and tear-down
//!
//! Subsystems walk an ordered sequence of runlevels, each traversed once on
//! the way up and once on the way down, and each traversal subdivided into a
//! configurable number of phases. The driver is sequential: every subsystem
//! finishes the current phase before the next phase begins, which is the
//! implicit barrier later phases rely on (the transport wires its outbound
//! handles in the network phase assuming every neighbor allocated queues in
//! the preceding config phase).
//!
//! During the first config-parse phase a subsystem may request additional
//! phases at a later runlevel via [`PhaseSchedule::ensure_phase_up`]; the
//! driver reads the schedule lazily so those requests take effect when the
//! runlevel is reached.

use std::sync::atomic::{ AtomicU32, Ordering };
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{ debug, info };

use crate::constants::{ DEFAULT_PHASES_PER_RUNLEVEL, MAX_PHASES_PER_RUNLEVEL };
use crate::error::{ Result, WeftError };

/// The canonical runlevels, in bring-up order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Runlevel {
    /// Parse configuration, allocate structures
    ConfigParse = 0,
    /// Neighbor queues exist, wiring is legal
    NetworkOk = 1,
    /// Policy domains initialised
    PdOk = 2,
    /// Memory engines ready
    MemoryOk = 3,
    /// Handle registry ready
    GuidOk = 4,
    /// Workers running
    ComputeOk = 5,
    /// User code admitted
    UserOk = 6,
}

impl Runlevel {
    /// All runlevels in bring-up order
    pub const ALL: [Runlevel; 7] = [
        Runlevel::ConfigParse,
        Runlevel::NetworkOk,
        Runlevel::PdOk,
        Runlevel::MemoryOk,
        Runlevel::GuidOk,
        Runlevel::ComputeOk,
        Runlevel::UserOk,
    ];
}

/// Property bits on a runlevel transition call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RlProps(u32);

impl RlProps {
    /// Upward traversal
    pub const BRING_UP: RlProps = RlProps(0x1);
    /// Downward traversal
    pub const TEAR_DOWN: RlProps = RlProps(0x2);
    /// Caller's request to enter the phase
    pub const REQUEST: RlProps = RlProps(0x4);
    /// Re-poll of a deferred acknowledgement
    pub const RESPONSE: RlProps = RlProps(0x8);
    /// Final commit of the phase
    pub const RELEASE: RlProps = RlProps(0x10);
    /// Transition triggered by a remote message
    pub const FROM_MSG: RlProps = RlProps(0x20);

    /// Combine property sets
    pub fn with(self, other: RlProps) -> RlProps {
        RlProps(self.0 | other.0)
    }

    /// Check whether every bit of `other` is set
    pub fn contains(self, other: RlProps) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// A subsystem's answer to a phase request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseAck {
    /// Work done inline; the phase is complete for this subsystem
    Complete,
    /// Work still in flight; the driver re-polls with `RESPONSE`
    Deferred,
}

/// Phase counts per runlevel and direction
pub struct PhaseSchedule {
    up: [AtomicU32; 7],
    down: [AtomicU32; 7],
}

impl PhaseSchedule {
    fn new() -> Self {
        Self {
            up: std::array::from_fn(|_| AtomicU32::new(DEFAULT_PHASES_PER_RUNLEVEL)),
            down: std::array::from_fn(|_| AtomicU32::new(DEFAULT_PHASES_PER_RUNLEVEL)),
        }
    }

    /// Guarantee at least `min` bring-up phases at `rl`
    pub fn ensure_phase_up(&self, rl: Runlevel, min: u32) -> Result<()> {
        Self::raise(&self.up[rl as usize], min)
    }

    /// Guarantee at least `min` tear-down phases at `rl`
    pub fn ensure_phase_down(&self, rl: Runlevel, min: u32) -> Result<()> {
        Self::raise(&self.down[rl as usize], min)
    }

    fn raise(cell: &AtomicU32, min: u32) -> Result<()> {
        if min == 0 || min > MAX_PHASES_PER_RUNLEVEL {
            return Err(WeftError::runlevel(format!(
                "phase request {min} out of range"
            )));
        }
        cell.fetch_max(min, Ordering::Relaxed);
        Ok(())
    }

    /// Number of bring-up phases at `rl`
    pub fn phases_up(&self, rl: Runlevel) -> u32 {
        self.up[rl as usize].load(Ordering::Relaxed)
    }

    /// Number of tear-down phases at `rl`
    pub fn phases_down(&self, rl: Runlevel) -> u32 {
        self.down[rl as usize].load(Ordering::Relaxed)
    }

    /// Whether `phase` is the first bring-up phase of `rl`
    pub fn is_first_phase_up(&self, _rl: Runlevel, phase: u32) -> bool {
        phase == 0
    }

    /// Whether `phase` is the last bring-up phase of `rl`
    pub fn is_last_phase_up(&self, rl: Runlevel, phase: u32) -> bool {
        phase + 1 == self.phases_up(rl)
    }

    /// Whether `phase` is the last tear-down phase of `rl`
    pub fn is_last_phase_down(&self, rl: Runlevel, phase: u32) -> bool {
        phase + 1 == self.phases_down(rl)
    }
}

/// A participant in the runlevel walk
pub trait Subsystem: Send + Sync {
    /// Name for diagnostics
    fn name(&self) -> &str;

    /// One phase of one runlevel traversal
    ///
    /// Called with `REQUEST` to enter the phase (re-polled with
    /// `REQUEST|RESPONSE` after a [`PhaseAck::Deferred`]), then once with
    /// `RELEASE` after every subsystem completed the phase.
    fn switch_runlevel(
        &self,
        schedule: &PhaseSchedule,
        rl: Runlevel,
        phase: u32,
        props: RlProps,
    ) -> Result<PhaseAck>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MachineState {
    Down,
    Up,
}

/// Sequential driver walking all subsystems through the runlevels
pub struct RunlevelMachine {
    subsystems: Vec<Arc<dyn Subsystem>>,
    schedule: PhaseSchedule,
    state: Mutex<MachineState>,
}

impl RunlevelMachine {
    /// Create a machine over `subsystems`, ordered by bring-up position
    pub fn new(subsystems: Vec<Arc<dyn Subsystem>>) -> Self {
        Self {
            subsystems,
            schedule: PhaseSchedule::new(),
            state: Mutex::new(MachineState::Down),
        }
    }

    /// The shared phase schedule
    pub fn schedule(&self) -> &PhaseSchedule {
        &self.schedule
    }

    /// Walk every runlevel upward, phase by phase
    pub fn bring_up(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == MachineState::Up {
            return Err(WeftError::runlevel("already brought up"));
        }
        for rl in Runlevel::ALL {
            let phases = self.schedule.phases_up(rl);
            for phase in 0..phases {
                debug!(?rl, phase, "bring-up phase");
                self.run_phase(rl, phase, RlProps::BRING_UP)?;
            }
            info!(?rl, "runlevel up");
        }
        *state = MachineState::Up;
        Ok(())
    }

    /// Walk every runlevel downward, phase by phase, subsystems in reverse
    ///
    /// `extra` is merged into every call; pass `FROM_MSG` when a remote
    /// message triggered the teardown.
    pub fn tear_down(&self, extra: RlProps) -> Result<()> {
        let mut state = self.state.lock();
        if *state == MachineState::Down {
            return Err(WeftError::runlevel("not brought up"));
        }
        for rl in Runlevel::ALL.iter().rev() {
            let phases = self.schedule.phases_down(*rl);
            for phase in 0..phases {
                debug!(rl = ?*rl, phase, "tear-down phase");
                self.run_phase(*rl, phase, RlProps::TEAR_DOWN.with(extra))?;
            }
            info!(rl = ?*rl, "runlevel down");
        }
        *state = MachineState::Down;
        Ok(())
    }

    /// Whether the machine currently sits at the top of the walk
    pub fn is_up(&self) -> bool {
        *self.state.lock() == MachineState::Up
    }

    fn run_phase(&self, rl: Runlevel, phase: u32, props: RlProps) -> Result<()> {
        let order: Box<dyn Iterator<Item = &Arc<dyn Subsystem>>> =
            if props.contains(RlProps::TEAR_DOWN) {
                Box::new(self.subsystems.iter().rev())
            } else {
                Box::new(self.subsystems.iter())
            };
        let order: Vec<_> = order.collect();

        for s in &order {
            let mut ack =
                s.switch_runlevel(&self.schedule, rl, phase, props.with(RlProps::REQUEST))?;
            while ack == PhaseAck::Deferred {
                ack = s.switch_runlevel(
                    &self.schedule,
                    rl,
                    phase,
                    props.with(RlProps::REQUEST).with(RlProps::RESPONSE),
                )?;
            }
        }
        // Barrier reached: every subsystem completed the phase; commit
        for s in &order {
            s.switch_runlevel(&self.schedule, rl, phase, props.with(RlProps::RELEASE))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Runlevel, u32, bool, bool)>>,
        defers_left: AtomicUsize,
    }

    impl Subsystem for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn switch_runlevel(
            &self,
            _schedule: &PhaseSchedule,
            rl: Runlevel,
            phase: u32,
            props: RlProps,
        ) -> Result<PhaseAck> {
            self.calls.lock().push((
                rl,
                phase,
                props.contains(RlProps::BRING_UP),
                props.contains(RlProps::RELEASE),
            ));
            if !props.contains(RlProps::RELEASE)
                && self.defers_left.load(Ordering::Relaxed) > 0
            {
                self.defers_left.fetch_sub(1, Ordering::Relaxed);
                return Ok(PhaseAck::Deferred);
            }
            Ok(PhaseAck::Complete)
        }
    }

    struct PhaseRequester;

    impl Subsystem for PhaseRequester {
        fn name(&self) -> &str {
            "phase-requester"
        }

        fn switch_runlevel(
            &self,
            schedule: &PhaseSchedule,
            rl: Runlevel,
            phase: u32,
            props: RlProps,
        ) -> Result<PhaseAck> {
            if rl == Runlevel::ConfigParse
                && props.contains(RlProps::BRING_UP)
                && schedule.is_first_phase_up(rl, phase)
                && !props.contains(RlProps::RELEASE)
            {
                schedule.ensure_phase_up(Runlevel::NetworkOk, 2)?;
            }
            Ok(PhaseAck::Complete)
        }
    }

    #[test]
    fn test_bring_up_walks_all_runlevels_in_order() {
        let rec = Arc::new(Recorder::default());
        let machine = RunlevelMachine::new(vec![rec.clone()]);
        machine.bring_up().unwrap();
        assert!(machine.is_up());

        let calls = rec.calls.lock();
        let up_requests: Vec<Runlevel> = calls
            .iter()
            .filter(|(_, _, up, release)| *up && !*release)
            .map(|(rl, _, _, _)| *rl)
            .collect();
        assert_eq!(up_requests, Runlevel::ALL.to_vec());
    }

    #[test]
    fn test_release_follows_every_phase() {
        let rec = Arc::new(Recorder::default());
        let machine = RunlevelMachine::new(vec![rec.clone()]);
        machine.bring_up().unwrap();

        let calls = rec.calls.lock();
        let requests = calls.iter().filter(|(_, _, _, r)| !*r).count();
        let releases = calls.iter().filter(|(_, _, _, r)| *r).count();
        assert_eq!(requests, releases);
    }

    #[test]
    fn test_deferred_subsystem_is_repolled() {
        let rec = Arc::new(Recorder::default());
        rec.defers_left.store(3, Ordering::Relaxed);
        let machine = RunlevelMachine::new(vec![rec.clone()]);
        machine.bring_up().unwrap();

        // 3 extra request calls beyond the request+release pairs
        let calls = rec.calls.lock();
        let requests = calls.iter().filter(|(_, _, _, r)| !*r).count();
        let releases = calls.iter().filter(|(_, _, _, r)| *r).count();
        assert_eq!(requests, releases + 3);
    }

    #[test]
    fn test_ensure_phase_up_takes_effect_later() {
        let rec = Arc::new(Recorder::default());
        let machine =
            RunlevelMachine::new(vec![Arc::new(PhaseRequester), rec.clone()]);
        machine.bring_up().unwrap();

        let calls = rec.calls.lock();
        let network_phases: Vec<u32> = calls
            .iter()
            .filter(|(rl, _, up, release)| *rl == Runlevel::NetworkOk && *up && !*release)
            .map(|(_, phase, _, _)| *phase)
            .collect();
        assert_eq!(network_phases, vec![0, 1]);
    }

    #[test]
    fn test_tear_down_reverses_runlevels() {
        let rec = Arc::new(Recorder::default());
        let machine = RunlevelMachine::new(vec![rec.clone()]);
        machine.bring_up().unwrap();
        rec.calls.lock().clear();
        machine.tear_down(RlProps::default()).unwrap();
        assert!(!machine.is_up());

        let calls = rec.calls.lock();
        let down: Vec<Runlevel> = calls
            .iter()
            .filter(|(_, _, up, release)| !*up && !*release)
            .map(|(rl, _, _, _)| *rl)
            .collect();
        let mut expected = Runlevel::ALL.to_vec();
        expected.reverse();
        assert_eq!(down, expected);
    }

    #[test]
    fn test_double_transitions_rejected() {
        let machine = RunlevelMachine::new(vec![]);
        assert!(machine.tear_down(RlProps::default()).is_err());
        machine.bring_up().unwrap();
        assert!(machine.bring_up().is_err());
        machine.tear_down(RlProps::FROM_MSG).unwrap();
        assert!(machine.tear_down(RlProps::default()).is_err());
    }
}
