// NEOX ERROR TAXONOMY
// DRIVER ERRORS COME FROM THE FREQUENCY DRIVER COLLABORATOR.
// GOVERNOR ERRORS ARE WHAT THE HOST LIFECYCLE AND CONFIGURATION SURFACE SEE.
// CLOCK ANOMALIES ARE NOT ERRORS: THE SAMPLER SKIPS THE CPU AND MOVES ON.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    // READ/WRITE OF THE UNDERLYING CONTROL FILE FAILED
    Io(String),
    // DRIVER REFUSED THE REQUESTED TARGET
    Rejected { cpu: usize, target: u32 },
    // NO POLICY FOR THIS CPU
    Unavailable(usize),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Io(msg) => write!(f, "driver I/O error: {}", msg),
            DriverError::Rejected { cpu, target } => {
                write!(f, "driver rejected {} kHz on cpu {}", target, cpu)
            }
            DriverError::Unavailable(cpu) => write!(f, "no cpufreq policy for cpu {}", cpu),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    // REJECTED SYNCHRONOUSLY, STATE UNCHANGED
    InvalidParameter(String),
    // FREQUENCY REQUEST FAILED ON A CALLER-INVOKED PATH
    Driver(DriverError),
    // SETUP FAILED DURING START (SURFACE INSTALL, WORKER SPAWN)
    Resource(String),
}

impl fmt::Display for GovernorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GovernorError::InvalidParameter(msg) => write!(f, "invalid parameter: {}", msg),
            GovernorError::Driver(e) => write!(f, "{}", e),
            GovernorError::Resource(msg) => write!(f, "resource setup failed: {}", msg),
        }
    }
}

impl std::error::Error for GovernorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GovernorError::Driver(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DriverError> for GovernorError {
    fn from(e: DriverError) -> Self {
        GovernorError::Driver(e)
    }
}

pub(crate) fn invalid(msg: impl Into<String>) -> GovernorError {
    GovernorError::InvalidParameter(msg.into())
}
