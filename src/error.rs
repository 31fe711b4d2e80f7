//! Unified error types for the Sercos III master stack.
//!
//! One `Error` enum that every subsystem can convert into, keeping the
//! blocking API surface uniform. All variants are `Copy` so they can be
//! passed through the phase handler and cyclic engine without allocation.
//!
//! The cyclic path itself never returns these for network conditions —
//! telegram losses and overruns are surfaced through counters and flags
//! (see [`crate::cyclic`]). Errors here belong to the blocking calls:
//! phase switching, SVC transactions, configuration.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level master error
// ---------------------------------------------------------------------------

/// Every fallible operation in the stack funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument (null-equivalent, out-of-range index, bad length).
    Parameter(&'static str),
    /// Operation is not allowed in the current communication phase.
    WrongPhase,
    /// Phase handler failure.
    Phase(PhaseError),
    /// Service channel transaction failure.
    Svc(SvcError),
    /// Configuration is invalid or does not fit the telegram budget.
    Config(ConfigError),
    /// Hot-plug admission failed for the given slave index.
    HotPlug(u16),
    /// Cyclic communication condition escalated past its threshold.
    Cyclic(CyclicError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parameter(msg) => write!(f, "parameter: {msg}"),
            Self::WrongPhase => write!(f, "not allowed in current phase"),
            Self::Phase(e) => write!(f, "phase: {e}"),
            Self::Svc(e) => write!(f, "svc: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::HotPlug(idx) => write!(f, "hot-plug failed for slave {idx}"),
            Self::Cyclic(e) => write!(f, "cyclic: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Phase handler errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseError {
    /// Requested transition is not legal from the current phase
    /// (switch-back is only allowed to CP0, and to NRT only from CP0).
    IllegalTransition,
    /// The phase switch did not complete within its timeout.
    Timeout,
    /// A configured slave did not answer during startup.
    /// Carries the Sercos address of the first missing slave.
    DeviceMissing(u16),
    /// A slave advertises a communication version the master does not accept.
    VersionMismatch,
    /// The timing solver could not fit MDT, AT, and UC windows into the cycle.
    TimingUnsolvable,
    /// Another phase-switch, hot-plug, or ring-recovery call is in progress.
    HandlerBusy,
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalTransition => write!(f, "illegal phase transition"),
            Self::Timeout => write!(f, "phase switch timed out"),
            Self::DeviceMissing(addr) => write!(f, "slave {addr} not responding"),
            Self::VersionMismatch => write!(f, "communication version mismatch"),
            Self::TimingUnsolvable => write!(f, "timing calculation failed"),
            Self::HandlerBusy => write!(f, "phase handler busy"),
        }
    }
}

impl From<PhaseError> for Error {
    fn from(e: PhaseError) -> Self {
        Self::Phase(e)
    }
}

// ---------------------------------------------------------------------------
// Service channel errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcError {
    /// Busy timeout expired before the slave finished the transfer.
    Timeout,
    /// Malformed handshake (acknowledge without request, element mismatch).
    Protocol,
    /// The slave set its error bit; carries the Sercos error code it returned.
    Slave(u16),
    /// `svc_command` was issued on an IDN whose attribute does not mark it
    /// as a procedure command.
    NotProcedureCommand,
    /// A transaction for this slave is already in flight and
    /// `cancel_in_flight` was not set.
    Busy,
    /// The transaction was cancelled by a higher-priority request.
    Cancelled,
    /// The caller's buffer is too small for the value the slave returned.
    BufferTooSmall,
}

impl fmt::Display for SvcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "busy timeout"),
            Self::Protocol => write!(f, "protocol error"),
            Self::Slave(code) => write!(f, "slave error 0x{code:04X}"),
            Self::NotProcedureCommand => write!(f, "IDN is not a procedure command"),
            Self::Busy => write!(f, "transaction in flight"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::BufferTooSmall => write!(f, "buffer too small"),
        }
    }
}

impl From<SvcError> for Error {
    fn from(e: SvcError) -> Self {
        Self::Svc(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Cycle time violates the validity rule for the targeted phase.
    CycleTimeInvalid,
    /// Connection regions do not fit the telegram payload budget.
    TooLarge,
    /// A field failed range validation; the message names the field.
    Validation(&'static str),
    /// A Sercos-list framed buffer has an inconsistent length header.
    ListFraming,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CycleTimeInvalid => write!(f, "invalid cycle time"),
            Self::TooLarge => write!(f, "configuration too large for telegram"),
            Self::Validation(msg) => write!(f, "validation failed: {msg}"),
            Self::ListFraming => write!(f, "bad Sercos list framing"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Cyclic communication errors
// ---------------------------------------------------------------------------

/// Escalated cyclic conditions. A single telegram loss or deadline miss is
/// counted, not raised; these appear once the accepted-loss threshold is
/// crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclicError {
    /// Consecutive cycle overruns exceeded the accepted-loss threshold.
    Overrun,
    /// A producer exceeded its accepted telegram losses and tripped to Error.
    DataError,
}

impl fmt::Display for CyclicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overrun => write!(f, "cycle deadline overrun"),
            Self::DataError => write!(f, "cyclic data error"),
        }
    }
}

impl From<CyclicError> for Error {
    fn from(e: CyclicError) -> Self {
        Self::Cyclic(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Stack-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
