//! Streaming commands and the chain state machine.

use crate::{StreamError, StreamResult};
use strom_primitives::Speed;

/// Streaming direction parameter of `begin`.
pub const DIRECTION_FORWARD: i32 = 1;
/// Streaming direction parameter of `begin`.
pub const DIRECTION_BACKWARD: i32 = -1;

/// Flush parameter: what the application intends after the flush.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FlushMode {
    /// Full reset of the chain.
    #[default]
    Reset,
    /// Flush in preparation of a seek; decoders may keep configuration.
    Seek,
}

/// A command issued on a streaming chain through its proxy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamCommand {
    /// Transition to `ready`; `direction` is +1 or -1.
    Begin { direction: i32 },
    /// Transition to `streaming`; speed sign must match the direction.
    Do { speed: Speed },
    /// Single-shot advance while `ready`; sign must match the direction.
    Step { frames: i32 },
    /// Drop pending data and return to `idle`.
    Flush { mode: FlushMode },
}

impl StreamCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            StreamCommand::Begin { .. } => CommandKind::Begin,
            StreamCommand::Do { .. } => CommandKind::Do,
            StreamCommand::Step { .. } => CommandKind::Step,
            StreamCommand::Flush { .. } => CommandKind::Flush,
        }
    }
}

/// Command identity without parameters, as reported in completion messages.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Begin,
    Do,
    Step,
    Flush,
}

/// State of a streaming unit or chain.
///
/// Commands are only accepted in the steady states. The transitional states
/// are entered by the prepare phase and left when the last participant has
/// signalled completion. `Terminated` is reached when any participant's
/// command phase fails and is unrecoverable.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum StreamState {
    /// No processing
    #[default]
    Idle,
    /// Ready to receive data, decoding performed, no presentation
    Ready,
    /// Ready to receive data, decoding and presentation running
    Streaming,

    /// Unit not yet ready to receive data
    Preparing,
    /// Startup synchronisation in progress
    Starting,
    /// Presentation is being stopped
    Stopping,
    /// All data is being discarded
    Flushing,
    /// A fixed amount of data is being dropped
    Stepping,

    /// Unrecoverable failure during command execution
    Terminated,
}

impl StreamState {
    pub fn is_steady(self) -> bool {
        matches!(
            self,
            StreamState::Idle | StreamState::Ready | StreamState::Streaming
        )
    }

    /// The transitional state a command runs through when issued in this
    /// steady state, per the chain state table. `Err` when the command is
    /// not legal here.
    pub fn transition_for(self, command: &StreamCommand) -> StreamResult<StreamState> {
        match (self, command) {
            (StreamState::Idle, StreamCommand::Begin { .. }) => Ok(StreamState::Preparing),
            (StreamState::Ready, StreamCommand::Begin { .. }) => Ok(StreamState::Preparing),
            (StreamState::Streaming, StreamCommand::Begin { .. }) => Ok(StreamState::Stopping),
            (StreamState::Ready | StreamState::Streaming, StreamCommand::Do { .. }) => {
                Ok(StreamState::Starting)
            }
            (StreamState::Ready, StreamCommand::Step { .. }) => Ok(StreamState::Stepping),
            (
                StreamState::Idle | StreamState::Ready | StreamState::Streaming,
                StreamCommand::Flush { .. },
            ) => Ok(StreamState::Flushing),
            _ => Err(StreamError::InvalidStateForCommand),
        }
    }

    /// The steady state a successfully completed command settles in.
    pub fn settled_for(command: CommandKind) -> StreamState {
        match command {
            CommandKind::Begin => StreamState::Ready,
            CommandKind::Do => StreamState::Streaming,
            CommandKind::Step => StreamState::Ready,
            CommandKind::Flush => StreamState::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandKind, FlushMode, StreamCommand, StreamState};
    use crate::StreamError;
    use strom_primitives::Speed;

    #[test]
    fn transition_table() {
        let begin = StreamCommand::Begin { direction: 1 };
        let run = StreamCommand::Do {
            speed: Speed::UNITY,
        };
        let step = StreamCommand::Step { frames: 1 };
        let flush = StreamCommand::Flush {
            mode: FlushMode::Reset,
        };

        assert_eq!(
            StreamState::Idle.transition_for(&begin),
            Ok(StreamState::Preparing)
        );
        assert_eq!(
            StreamState::Streaming.transition_for(&begin),
            Ok(StreamState::Stopping)
        );
        assert_eq!(
            StreamState::Idle.transition_for(&run),
            Err(StreamError::InvalidStateForCommand)
        );
        assert_eq!(
            StreamState::Streaming.transition_for(&step),
            Err(StreamError::InvalidStateForCommand)
        );
        assert_eq!(
            StreamState::Streaming.transition_for(&flush),
            Ok(StreamState::Flushing)
        );
        assert_eq!(
            StreamState::settled_for(CommandKind::Flush),
            StreamState::Idle
        );
    }
}
