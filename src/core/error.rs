use std::fmt;
use std::io;

/// Host-plane failure: anything that goes wrong in the emulator
/// process itself rather than in the emulated machine. Reported to
/// stderr and mapped to an exit code before the run loop starts; once
/// the run loop is running these never panic the process (SPI I/O
/// errors instead translate into the architectural data-error token).
#[derive(Debug)]
pub enum HostError {
    Io(io::Error),
    Malformed(String),
    BadImage(String),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::Io(e) => write!(f, "I/O error: {e}"),
            HostError::Malformed(msg) => write!(f, "malformed binary: {msg}"),
            HostError::BadImage(msg) => write!(f, "bad image: {msg}"),
        }
    }
}

impl std::error::Error for HostError {}

impl From<io::Error> for HostError {
    fn from(e: io::Error) -> Self {
        HostError::Io(e)
    }
}
