//! Queue entry status and its transition table.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::{AppErr, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "Waiting")]
    Waiting,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "In Call")]
    InCall,
    #[serde(rename = "Left Call")]
    LeftCall,
    #[serde(rename = "Done")]
    Done,
    #[serde(rename = "Cancelled")]
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Waiting,
        Status::InProgress,
        Status::InCall,
        Status::LeftCall,
        Status::Done,
        Status::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Waiting => "Waiting",
            Status::InProgress => "In Progress",
            Status::InCall => "In Call",
            Status::LeftCall => "Left Call",
            Status::Done => "Done",
            Status::Cancelled => "Cancelled",
        }
    }

    pub fn can_transition_to(self, target: Status) -> bool {
        use Status::*;
        matches!(
            (self, target),
            (Waiting, InProgress)
                | (Waiting, Cancelled)
                | (InProgress, InCall)
                | (InProgress, Done)
                | (InProgress, Cancelled)
                | (InCall, LeftCall)
                | (InCall, Done)
                | (InCall, Cancelled)
                | (LeftCall, InCall)
                | (LeftCall, Done)
                | (LeftCall, Cancelled)
        )
    }

    pub fn valid_transitions(self) -> Vec<Status> {
        Status::ALL
            .into_iter()
            .filter(|t| self.can_transition_to(*t))
            .collect()
    }

    pub fn transition_to(self, target: Status) -> AppResult<Status> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(AppErr::InvalidTransition { from: self, to: target })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Cancelled)
    }

    /// Whiteboard may only be open while the doctor is seeing the patient.
    pub fn allows_whiteboard(self) -> bool {
        matches!(self, Status::InProgress | Status::InCall)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = AppErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| AppErr::Bad(format!("unknown status {s:?}")))
    }
}
