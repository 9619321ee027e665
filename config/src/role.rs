//! Worker roles, control tokens, and the file names they map to on a target.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// File whose presence tells a remote bootstrap that every input file arrived.
pub const END_OF_FILE_MARKER: &str = "end_of_file_marker";

/// Role of one worker process within a trial.
///
/// A trial always has exactly one coordinator and `n >= 1` participants,
/// numbered `0..n`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Participant(usize),
}

impl Role {
    /// Short tag used in file names and manifests (`agg`, `party0`, ...).
    #[must_use]
    pub fn tag(&self) -> String {
        match self {
            Self::Coordinator => "agg".to_string(),
            Self::Participant(index) => format!("party{index}"),
        }
    }

    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        matches!(self, Self::Coordinator)
    }

    /// Name of this role's config document on the target.
    #[must_use]
    pub fn config_file_name(&self) -> String {
        format!("config_{}.yml", self.tag())
    }

    #[must_use]
    pub fn stdout_file_name(&self) -> String {
        format!("stdout_{}.txt", self.tag())
    }

    #[must_use]
    pub fn stderr_file_name(&self) -> String {
        format!("stderr_{}.txt", self.tag())
    }

    /// Control sequence sent when nothing else is configured.
    #[must_use]
    pub fn default_commands(&self) -> Vec<ControlToken> {
        match self {
            Self::Coordinator => vec![
                ControlToken::Start,
                ControlToken::Train,
                ControlToken::Eval,
                ControlToken::Stop,
            ],
            Self::Participant(_) => vec![ControlToken::Start, ControlToken::Register],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator => write!(f, "coordinator"),
            Self::Participant(index) => write!(f, "participant {index}"),
        }
    }
}

/// Token written to a worker's control channel. Workers consume them strictly
/// in order, one per line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlToken {
    Start,
    Register,
    Train,
    Eval,
    Save,
    Sync,
    Stop,
}

impl ControlToken {
    /// Whether a worker in `role` understands this token.
    #[must_use]
    pub fn allowed_for(self, role: Role) -> bool {
        match self {
            Self::Start | Self::Stop => true,
            Self::Register => !role.is_coordinator(),
            Self::Train | Self::Eval | Self::Save | Self::Sync => role.is_coordinator(),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Register => "REGISTER",
            Self::Train => "TRAIN",
            Self::Eval => "EVAL",
            Self::Save => "SAVE",
            Self::Sync => "SYNC",
            Self::Stop => "STOP",
        }
    }

    /// Newline-delimited wire form of a sequence, terminated by a newline.
    #[must_use]
    pub fn encode_sequence(tokens: &[Self]) -> String {
        tokens.iter().fold(String::new(), |mut out, token| {
            out.push_str(token.as_str());
            out.push('\n');
            out
        })
    }

    /// Check a whole sequence against a role, returning the first offender.
    pub fn validate_sequence(tokens: &[Self], role: Role) -> Result<(), InvalidToken> {
        match tokens.iter().find(|t| !t.allowed_for(role)) {
            Some(token) => Err(InvalidToken {
                token: token.as_str().to_string(),
                role: role.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for ControlToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlToken {
    type Err = InvalidToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "START" => Ok(Self::Start),
            "REGISTER" => Ok(Self::Register),
            "TRAIN" => Ok(Self::Train),
            "EVAL" => Ok(Self::Eval),
            "SAVE" => Ok(Self::Save),
            "SYNC" => Ok(Self::Sync),
            "STOP" => Ok(Self::Stop),
            _ => Err(InvalidToken {
                token: s.to_string(),
                role: "any role".to_string(),
            }),
        }
    }
}

/// A control token that does not exist or is not valid for a role.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{token}' is not a valid control token for {role}")]
pub struct InvalidToken {
    pub token: String,
    pub role: String,
}
