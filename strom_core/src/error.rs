//! Categorical result codes used across the streaming core.
//!
//! Flow control outcomes (`ObjectFull`, `ObjectEmpty`, `ObjectNotCurrent`)
//! are ordinary `Err` values the caller is expected to recover from; they
//! never poison a chain.

use thiserror::Error;

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Error, Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamError {
    /// A queue or packet is full; retry after the consumer drained.
    #[error("object full")]
    ObjectFull,
    /// A pool or queue is empty; retry after the producer refilled.
    #[error("object empty")]
    ObjectEmpty,
    /// The target (e.g. a linked chain) is not activated.
    #[error("object not current")]
    ObjectNotCurrent,
    /// The connector has no plugged peer.
    #[error("connector not connected")]
    NotConnected,
    /// A connector or unit id was out of range.
    #[error("range violation")]
    RangeViolation,
    /// The chain is in a transitional state and cannot take the command.
    #[error("invalid streaming state for command")]
    InvalidStateForCommand,
    /// The direction parameter of `begin` was neither +1 nor -1.
    #[error("invalid streaming direction")]
    InvalidDirection,
    /// The speed parameter of `do` was zero or against the direction.
    #[error("invalid streaming speed")]
    InvalidSpeed,
    /// The frame count of `step` was against the direction.
    #[error("invalid streaming step count")]
    InvalidStepCount,
    /// The streaming command was not recognized.
    #[error("invalid streaming command")]
    InvalidCommand,
    /// Another command is already mid-phase on this chain.
    #[error("already processing a command")]
    ProcessingCommand,
    #[error("not enough memory")]
    NotEnoughMemory,
    /// A unit was configured with contradictory construction parameters.
    #[error("invalid configuration")]
    InvalidConfiguration,
    /// A unit is missing a construction-time dependency.
    #[error("incomplete configuration")]
    IncompleteConfiguration,
    /// Sentinel between the parser and its host: apply these tags later
    /// through the deferred-configure path.
    #[error("defer stream parse configure")]
    DeferConfigure,
    /// The chain reached the unrecoverable terminated state.
    #[error("chain terminated")]
    Terminated,
    #[error("object not found")]
    NotFound,
    #[error("object already in use")]
    InUse,
    /// The unit does not implement this entry point.
    #[error("unsupported operation")]
    Unsupported,
}

impl StreamError {
    /// True for the flow control codes that mean "try again later".
    pub fn is_flow_control(self) -> bool {
        matches!(
            self,
            StreamError::ObjectFull | StreamError::ObjectEmpty | StreamError::ObjectNotCurrent
        )
    }
}
