/*!
error.rs - Crate-wide error vocabulary.

Two distinct failure shapes are used throughout this crate (see `spec.md`
§7 "Error handling design"):

- `EmuError` - a host-I/O failure during process init (a ROM/image/TTY
  file that cannot be opened or is malformed). These are fatal: the
  process aborts with a diagnostic before the scheduler ever starts.
- `DebuggerBreak` - a firmware-level programmer error discovered once the
  scheduler is running (unexpected port write, illegal DMA mode, a ModR/M
  decode that walks off the end of the opcode table). These are *not*
  Rust panics: the scheduler step function returns one, the machine logs
  it and halts, and an external debugger (out of scope for this crate,
  see `spec.md` §1) is the thing that would resume it.
*/

use std::fmt;

/// Fatal initialization error.
#[derive(Debug, thiserror::Error)]
pub enum EmuError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ROM image {path} is too large ({size} bytes) to load at {addr:#06x}")]
    RomTooLarge {
        path: String,
        size: usize,
        addr: usize,
    },
    #[error("floppy image {path} is {size} bytes, larger than the 2.88 MiB maximum")]
    FloppyImageTooLarge { path: String, size: usize },
    #[error("floppy image {path} has an unrecognized sectors-per-track byte {byte:#04x} at offset 0x18; pass -s to override")]
    UnknownFloppyGeometry { path: String, byte: u8 },
    #[error("hard disk image {path} is {size} bytes, larger than the 20,910,080 byte maximum")]
    HardDiskImageTooLarge { path: String, size: usize },
    #[error("bad command line: {0}")]
    BadArgs(String),
}

/// A firmware-visible programmer error: a condition the real hardware would
/// never hit but emulated firmware or a malformed driver can trigger.
///
/// Carrying a `String` (rather than a structured variant per call site)
/// matches `spec.md` §7's "enqueue a human-readable panic message" framing:
/// the debugger that would consume this is an external collaborator and
/// only needs the rendered text plus the component name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerBreak {
    pub component: &'static str,
    pub message: String,
}

impl DebuggerBreak {
    pub fn new(component: &'static str, message: impl Into<String>) -> Self {
        Self {
            component,
            message: message.into(),
        }
    }
}

impl fmt::Display for DebuggerBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.component, self.message)
    }
}

impl std::error::Error for DebuggerBreak {}

/// Shorthand for raising a `DebuggerBreak` from inside a device hook.
#[macro_export]
macro_rules! break_into_debugger {
    ($component:expr, $($arg:tt)*) => {
        return Err($crate::error::DebuggerBreak::new($component, format!($($arg)*)))
    };
}
