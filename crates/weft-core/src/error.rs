//! Error types for the weft runtime

use core::fmt;

use crate::event::Event;
use crate::state::FiberState;

/// Result type for runtime operations.
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors that can occur in runtime operations.
///
/// Misuse of the API (double event registration, resuming a fiber in the
/// wrong state) trips a `debug_assert!` at the call site and is reported
/// through these variants in release builds. Syscall failures always come
/// back as `Syscall` with the failing call and errno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// A fiber operation found the fiber in the wrong state
    /// (e.g. resume on RUNNING/TERM, reset on a non-TERM fiber).
    FiberState {
        /// State required by the operation.
        expected: FiberState,
        /// State actually observed.
        found: FiberState,
    },

    /// The (fd, event) pair is already registered.
    EventExists {
        /// Descriptor the registration targeted.
        fd: i32,
        /// Event that was already present in the mask.
        event: Event,
    },

    /// No scheduler is installed on the current thread.
    NoScheduler,

    /// Invalid configuration value.
    Config(&'static str),

    /// A system call failed.
    Syscall {
        /// Name of the failing call.
        call: &'static str,
        /// errno at the time of failure.
        errno: i32,
    },
}

impl WeftError {
    /// Build a `Syscall` error from the thread's current errno.
    pub fn last_os_error(call: &'static str) -> WeftError {
        WeftError::Syscall {
            call,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::FiberState { expected, found } => {
                write!(f, "fiber in state {} (operation requires {})", found, expected)
            }
            WeftError::EventExists { fd, event } => {
                write!(f, "event {} already registered for fd {}", event, fd)
            }
            WeftError::NoScheduler => write!(f, "no scheduler on this thread"),
            WeftError::Config(msg) => write!(f, "invalid config: {}", msg),
            WeftError::Syscall { call, errno } => {
                write!(
                    f,
                    "{} failed: {} (errno {})",
                    call,
                    std::io::Error::from_raw_os_error(*errno),
                    errno
                )
            }
        }
    }
}

impl std::error::Error for WeftError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = WeftError::NoScheduler;
        assert_eq!(format!("{}", e), "no scheduler on this thread");

        let e = WeftError::EventExists {
            fd: 7,
            event: Event::Read,
        };
        assert_eq!(format!("{}", e), "event READ already registered for fd 7");
    }

    #[test]
    fn test_fiber_state_display() {
        let e = WeftError::FiberState {
            expected: FiberState::Ready,
            found: FiberState::Term,
        };
        assert_eq!(
            format!("{}", e),
            "fiber in state TERM (operation requires READY)"
        );
    }
}
