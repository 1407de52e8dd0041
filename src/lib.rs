//! Host side of the SPANK plugin stack.
//!
//! A [`Stack`](stack::Stack) is built from a `plugstack.conf` document for one
//! of the five execution [`Context`]s. Each plugin it loads may register
//! command line options and export callbacks which are invoked, in load order,
//! at every [`Phase`](dispatch::Phase) of a job launch. Options parsed on the
//! submission side travel to the execution node through the environment (see
//! [`propagate`]).

use byte_strings::concat_bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::error::Error;
use std::ffi::CStr;
use std::fmt;
use std::fmt::Display;

pub mod config;
pub mod dispatch;
pub mod environ;
pub mod ffi;
pub mod handle;
pub mod job;
pub mod loader;
pub mod log;
pub mod option;
pub mod plugstack;
pub mod propagate;
pub mod runtime;
pub mod stack;
pub mod sys;

pub use config::Config;
pub use dispatch::{call_stack, CallError, Phase};
pub use environ::{Environ, JobEnv, NoJobEnv, ProcessEnv, ProcessImageJobEnv};
pub use handle::{Item, ItemValue, SpankHandle};
pub use job::{JobContext, JobOptionInfo, JobScriptInfo, LauncherJobInfo, StepRecord, TaskInfo};
pub use loader::{DlLoader, Module, ModuleError, Operations, PluginLoader, StaticLoader};
pub use log::{init_logging, LogLevel};
pub use option::{CliOption, OptionError, OptionRegistry, PluginOpt, SpankOption};
pub use runtime::{RuntimeError, Spank};
pub use stack::{LoadError, Plugin, Stack, StackBuilder};

/// Version strings handed out through the `SlurmVersion*` items.
pub const SLURM_VERSION_STRING: &str = env!("CARGO_PKG_VERSION");
pub const SLURM_VERSION_MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
pub const SLURM_VERSION_MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
pub const SLURM_VERSION_MICRO: &str = env!("CARGO_PKG_VERSION_PATCH");

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum SpankError {
    Generic = 1,
    BadArg = 2,
    NotTask = 3,
    EnvExists = 4,
    EnvNotExist = 5,
    NoSpace = 6,
    NotRemote = 7,
    NoExist = 8,
    NotExecd = 9,
    NotAvail = 10,
    NotLocal = 11,
}

impl SpankError {
    /// Converts a C status code, `0` being success.
    pub fn from_status(rc: u32) -> Result<(), SpankError> {
        match rc {
            0 => Ok(()),
            rc => Err(SpankError::try_from(rc).unwrap_or(SpankError::Generic)),
        }
    }

    /// Converts a result back into the C status code.
    pub fn status(result: Result<(), SpankError>) -> u32 {
        match result {
            Ok(()) => 0,
            Err(e) => e.into(),
        }
    }

    /// NUL terminated message, suitable for handing out through the C ABI.
    pub(crate) fn message(self) -> &'static [u8] {
        match self {
            SpankError::Generic => concat_bytes!(b"Generic error", b"\0"),
            SpankError::BadArg => concat_bytes!(b"Bad argument", b"\0"),
            SpankError::NotTask => concat_bytes!(b"Not in task context", b"\0"),
            SpankError::EnvExists => concat_bytes!(b"Environment variable exists", b"\0"),
            SpankError::EnvNotExist => concat_bytes!(b"No such environment variable", b"\0"),
            SpankError::NoSpace => concat_bytes!(b"Buffer too small", b"\0"),
            SpankError::NotRemote => concat_bytes!(b"Valid only in remote context", b"\0"),
            SpankError::NoExist => concat_bytes!(b"Id/PID does not exist on this node", b"\0"),
            SpankError::NotExecd => {
                concat_bytes!(b"Lookup by PID requested, but no tasks running", b"\0")
            }
            SpankError::NotAvail => concat_bytes!(b"Item not available from this callback", b"\0"),
            SpankError::NotLocal => {
                concat_bytes!(b"Valid only in local or allocator context", b"\0")
            }
        }
    }
}

impl Error for SpankError {}

impl Display for SpankError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match CStr::from_bytes_with_nul(self.message()).map(|m| m.to_str()) {
            Ok(Ok(err)) => write!(f, "{}", err),
            _ => write!(f, "Invalid Error"),
        }
    }
}

/// The execution context a stack is built for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Context {
    // We dont represent error here, as errors are better embedded in Results
    /// srun
    Local = 1,
    /// slurmstepd
    Remote = 2,
    /// sbatch/salloc
    Allocator = 3,
    /// slurmd
    Slurmd = 4,
    /// prolog/epilog
    JobScript = 5,
}
