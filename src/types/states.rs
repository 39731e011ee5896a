use std::fmt;

use serde::Serialize;
use tokio::time::Instant;

/// The lifecycle state of a job, including the deadline that drives it out
/// of the time-bound states. A delayed job becomes ready once `until`
/// passes; a reserved job is forcibly returned to ready once `deadline`
/// passes (a TTR timeout).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Ready,
    Delayed { until: Instant },
    Reserved { deadline: Instant },
    Buried,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        use JobState::*;

        match self {
            Ready => "ready",
            Delayed { until: _ } => "delayed",
            Reserved { deadline: _ } => "reserved",
            Buried => "buried",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

// This impl is used to allow JobStats to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.name())
    }
}
