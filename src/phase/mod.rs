//! Communication phases and the startup step ladder.
//!
//! The Sercos startup is a linear sequence of sub-states; each one has an
//! enter action and a poll action, run by the [`steps`](self::steps)
//! table until the step reports done. The phase visible to the outside is
//! derived from the last completed step:
//!
//! ```text
//! Initialize → InitHardware → SetCommParam → SetNrtMode → SetCp0 →
//! InitConfig → SetCp1 → SetCp2 → CheckVersion → GetTimingData →
//! CalcTiming → TransmitTiming → SetCp3 → FillConnInfo → SetCp4
//! ```
//!
//! From steady state (CP4), `HotPlug`, `TransHp2Para`, and `RingRecovery`
//! run as excursions that return to `SetCp4`.

pub mod steps;
pub mod timing;

use serde::{Deserialize, Serialize};

use crate::error::{Error, PhaseError};

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Communication phase as visible to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// Non-real-time mode: the ports act as plain Ethernet.
    Nrt,
    Cp0,
    Cp1,
    Cp2,
    Cp3,
    Cp4,
}

impl Phase {
    /// Phase number announced in the telegram header (NRT emits nothing).
    pub fn number(self) -> u8 {
        match self {
            Self::Nrt => 0,
            Self::Cp0 => 0,
            Self::Cp1 => 1,
            Self::Cp2 => 2,
            Self::Cp3 => 3,
            Self::Cp4 => 4,
        }
    }
}

/// Target of a phase switch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTarget {
    Phase(Phase),
    /// Advance exactly one step bundle (commissioning aid).
    Next,
    /// Stop after the timing parameters were written to the slaves.
    Cp2AfterParamsTransmit,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Startup sub-states, in ladder order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Step {
    Idle = 0,
    Initialize,
    InitHardware,
    SetCommParam,
    SetNrtMode,
    SetCp0,
    InitConfig,
    SetCp1,
    SetCp2,
    CheckVersion,
    GetTimingData,
    CalcTiming,
    TransmitTiming,
    SetCp3,
    FillConnInfo,
    SetCp4,
    // Excursions from steady state; they return to SetCp4.
    HotPlug,
    TransHp2Para,
    RingRecovery,
}

impl Step {
    pub const COUNT: usize = 19;

    /// The phase the network is in once this step has completed.
    pub fn phase(self) -> Phase {
        match self {
            Self::Idle | Self::Initialize | Self::InitHardware | Self::SetCommParam
            | Self::SetNrtMode => Phase::Nrt,
            Self::SetCp0 | Self::InitConfig => Phase::Cp0,
            Self::SetCp1 => Phase::Cp1,
            Self::SetCp2 | Self::CheckVersion | Self::GetTimingData | Self::CalcTiming
            | Self::TransmitTiming => Phase::Cp2,
            Self::SetCp3 | Self::FillConnInfo => Phase::Cp3,
            Self::SetCp4 | Self::HotPlug | Self::TransHp2Para | Self::RingRecovery => Phase::Cp4,
        }
    }

    /// The ladder step that completes the given target.
    pub fn for_target(target: Phase) -> Self {
        match target {
            Phase::Nrt => Self::SetNrtMode,
            Phase::Cp0 => Self::SetCp0,
            Phase::Cp1 => Self::SetCp1,
            Phase::Cp2 => Self::SetCp2,
            Phase::Cp3 => Self::FillConnInfo,
            Phase::Cp4 => Self::SetCp4,
        }
    }

    /// Next step up the ladder, `None` past `SetCp4`.
    pub fn next(self) -> Option<Self> {
        use Step::*;
        Some(match self {
            Idle => Initialize,
            Initialize => InitHardware,
            InitHardware => SetCommParam,
            SetCommParam => SetNrtMode,
            SetNrtMode => SetCp0,
            SetCp0 => InitConfig,
            InitConfig => SetCp1,
            SetCp1 => SetCp2,
            SetCp2 => CheckVersion,
            CheckVersion => GetTimingData,
            GetTimingData => CalcTiming,
            CalcTiming => TransmitTiming,
            TransmitTiming => SetCp3,
            SetCp3 => FillConnInfo,
            FillConnInfo => SetCp4,
            SetCp4 | HotPlug | TransHp2Para | RingRecovery => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// Phase state
// ---------------------------------------------------------------------------

/// Handler occupancy, one blocking call at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Running,
}

/// Bookkeeping of the phase handler.
#[derive(Debug, Clone)]
pub struct PhaseState {
    pub handler: HandlerState,
    /// Last completed ladder step.
    pub current: Step,
    /// Step the running request drives toward.
    pub target: Step,
    /// Step currently executing, if any.
    pub active: Option<Step>,
    pub retries_left: u32,
    /// Handler polls to skip (switch-back power-off delay).
    pub sleep_polls: u32,
    pub switching_back: bool,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            handler: HandlerState::Idle,
            current: Step::Idle,
            target: Step::Idle,
            active: None,
            retries_left: 0,
            sleep_polls: 0,
            switching_back: false,
        }
    }
}

impl PhaseState {
    pub fn phase(&self) -> Phase {
        self.current.phase()
    }

    /// Validate a requested target against the switch-back rules:
    /// forward moves are free; backward moves are legal only to CP0, and
    /// to NRT only from CP0 or below.
    pub fn check_target(&self, target: PhaseTarget) -> Result<Step, Error> {
        if self.handler != HandlerState::Idle {
            return Err(PhaseError::HandlerBusy.into());
        }
        match target {
            PhaseTarget::Phase(Phase::Cp0) => Ok(Step::SetCp0),
            PhaseTarget::Phase(Phase::Nrt) => {
                if self.current <= Step::SetCp0 {
                    Ok(Step::SetNrtMode)
                } else {
                    Err(PhaseError::IllegalTransition.into())
                }
            }
            PhaseTarget::Phase(phase) => {
                let step = Step::for_target(phase);
                if self.current < step {
                    Ok(step)
                } else {
                    Err(PhaseError::IllegalTransition.into())
                }
            }
            PhaseTarget::Cp2AfterParamsTransmit => {
                if self.current < Step::TransmitTiming {
                    Ok(Step::TransmitTiming)
                } else {
                    Err(PhaseError::IllegalTransition.into())
                }
            }
            PhaseTarget::Next => match self.current.next() {
                Some(step) => Ok(step),
                None => Err(PhaseError::IllegalTransition.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_phase_mapping_is_monotone_up_the_ladder() {
        let mut step = Step::Idle;
        let mut last = Phase::Nrt;
        while let Some(next) = step.next() {
            assert!(next.phase() >= last, "{next:?} dropped below {last:?}");
            last = next.phase();
            step = next;
        }
        assert_eq!(step, Step::SetCp4);
        assert_eq!(step.phase(), Phase::Cp4);
    }

    #[test]
    fn forward_targets_are_legal() {
        let state = PhaseState::default();
        assert_eq!(
            state.check_target(PhaseTarget::Phase(Phase::Cp4)).unwrap(),
            Step::SetCp4
        );
        assert_eq!(
            state.check_target(PhaseTarget::Phase(Phase::Cp2)).unwrap(),
            Step::SetCp2
        );
    }

    #[test]
    fn switch_back_only_to_cp0() {
        let mut state = PhaseState::default();
        state.current = Step::SetCp4;
        assert!(state.check_target(PhaseTarget::Phase(Phase::Cp0)).is_ok());
        for phase in [Phase::Cp1, Phase::Cp2, Phase::Cp3, Phase::Nrt] {
            assert!(
                state.check_target(PhaseTarget::Phase(phase)).is_err(),
                "switch-back to {phase:?} must be rejected"
            );
        }
    }

    #[test]
    fn nrt_reachable_from_cp0_or_below() {
        let mut state = PhaseState::default();
        state.current = Step::SetCp0;
        assert!(state.check_target(PhaseTarget::Phase(Phase::Nrt)).is_ok());
        state.current = Step::SetCp1;
        assert!(state.check_target(PhaseTarget::Phase(Phase::Nrt)).is_err());
    }

    #[test]
    fn busy_handler_rejects_requests() {
        let mut state = PhaseState::default();
        state.handler = HandlerState::Running;
        assert!(matches!(
            state.check_target(PhaseTarget::Phase(Phase::Cp1)),
            Err(Error::Phase(PhaseError::HandlerBusy))
        ));
    }

    #[test]
    fn next_target_steps_once() {
        let mut state = PhaseState::default();
        state.current = Step::SetCp1;
        assert_eq!(state.check_target(PhaseTarget::Next).unwrap(), Step::SetCp2);
        state.current = Step::SetCp4;
        assert!(state.check_target(PhaseTarget::Next).is_err());
    }
}
