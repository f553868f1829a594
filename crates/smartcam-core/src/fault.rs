/// Classification of every error the pipeline catches and survives.
///
/// Each catch site tags its log line with one of these kinds so that a
/// failure can be traced to its handling policy:
///   - `TransientIo`    retried in place or on the next cycle
///   - `Resolution`     device dropped from the active set
///   - `Configuration`  fatal at startup, skipped per entry otherwise
///   - `Collaborator`   detector / classifier / upload, item skipped

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    TransientIo,
    Resolution,
    Configuration,
    Collaborator,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientIo => "transient_io",
            Self::Resolution => "resolution",
            Self::Configuration => "configuration",
            Self::Collaborator => "collaborator",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
