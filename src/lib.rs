//*****************
//External crates
//*****************
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate slog;
#[macro_use]
extern crate bitflags;

//*****************
//Modules declaration
//*****************
pub mod aodv;
pub mod logging;
pub mod node;

//*****************
//Constants
//*****************
/// Well-known UDP port for AODV control traffic (RFC 3561, section 10).
pub const AODV_PORT: u16 = 654;
pub const ONE_SECOND_MS: i64 = 1_000;

//*****************
//Errors
//*****************
use std::error::Error;
use std::fmt;

/// Error struct for this crate
#[derive(Debug)]
pub struct AodvError {
    pub cause: Option<Box<dyn Error>>,
    pub kind: AodvErrorKind,
}

/// Types of errors produced in this crate
#[derive(Debug)]
pub enum AodvErrorKind {
    /// Failures related to [de]serializing data
    Serialization(String),
    /// Failures in configuration of the system
    Configuration(String),
    /// Networking related failures
    Networking(String),
    /// Errors from the Node runtime
    Node(String),
}

impl Error for AodvError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self.cause {
            Some(ref cause) => Some(&**cause),
            None => None,
        }
    }
}

impl fmt::Display for AodvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl fmt::Display for AodvErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AodvErrorKind::Serialization(msg) => write!(f, "{}", msg),
            AodvErrorKind::Configuration(msg) => write!(f, "{}", msg),
            AodvErrorKind::Networking(msg) => write!(f, "{}", msg),
            AodvErrorKind::Node(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<AodvErrorKind> for AodvError {
    fn from(kind: AodvErrorKind) -> AodvError {
        AodvError { cause: None, kind }
    }
}
