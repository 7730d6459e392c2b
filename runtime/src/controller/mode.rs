//! Balance mode machine.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Wheels and legs commanded to zero, waiting for a start command.
    #[default]
    Stopped,
    /// Active control law running.
    Balancing,
    /// Tilt or fault detected. Only an explicit reset leaves this mode.
    Fallen,
}

/// Inputs of the mode machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Start,
    Stop,
    Reset,
    /// Pitch within bounds.
    Nominal,
    /// `|pitch|` beyond the fall threshold.
    Tilted,
    /// Invalid observation or lost spine connection.
    Fault,
}

/// Commands an operator may send between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorCommand {
    Start,
    Stop,
    Reset,
}

impl From<OperatorCommand> for Signal {
    fn from(command: OperatorCommand) -> Self {
        match command {
            OperatorCommand::Start => Signal::Start,
            OperatorCommand::Stop => Signal::Stop,
            OperatorCommand::Reset => Signal::Reset,
        }
    }
}

/// A mode change, reported once when it happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: Mode,
    pub to: Mode,
    pub signal: Signal,
}

impl Mode {
    /// Total transition function over `(mode, signal)`.
    pub fn next(self, signal: Signal) -> Mode {
        use Mode::*;
        use Signal::*;

        match (self, signal) {
            (Stopped, Start) => Balancing,
            (Stopped, Fault) => Fallen,
            (Stopped, Stop | Reset | Nominal | Tilted) => Stopped,

            (Balancing, Stop | Reset) => Stopped,
            (Balancing, Tilted | Fault) => Fallen,
            (Balancing, Start | Nominal) => Balancing,

            (Fallen, Reset) => Stopped,
            (Fallen, Start | Stop | Nominal | Tilted | Fault) => Fallen,
        }
    }

    pub fn is_active(self) -> bool {
        self == Mode::Balancing
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Stopped => "STOPPED",
            Mode::Balancing => "BALANCING",
            Mode::Fallen => "FALLEN",
        };
        f.write_str(name)
    }
}
