//! Error types at the loader and runtime boundaries.
//!
//! Producer-side (assembler) errors live in `agni-asm` instead, next
//! to the code that raises them.

use crate::opcode::Status;
use crate::value::CoercionError;

/// A script handle, kept alongside faults and load failures so a host
/// juggling many scripts can tell which one misbehaved.
pub type ScriptHandle = u32;

/// Failure to load an executable into the script registry. Each
/// variant maps 1:1 onto one of the failure cases of [`Status`], so a
/// caller who only wants the coarse code can match on that via
/// [`LoadError::status`].
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("could not open the executable: {0}")]
    CannotOpen(#[from] std::io::Error),
    #[error("executable is malformed: {0}")]
    BadExecutable(#[from] agni_image::ImageError),
    #[error("executable checksum does not match its contents")]
    BadChecksum,
    #[error("executable requires a newer Agni runtime than this one")]
    OldAgniRuntime,
    #[error("executable was built for a different host, or requires a newer host version")]
    OldHost,
    #[error("executable was built for a different host")]
    WrongHost,
    #[error("no free slot in the script registry")]
    ThreadsExhausted,
}

impl LoadError {
    pub fn status(&self) -> Status {
        match self {
            LoadError::CannotOpen(_) => Status::CannotOpen,
            LoadError::BadExecutable(_) => Status::BadExecutable,
            LoadError::BadChecksum => Status::BadChecksum,
            LoadError::OldAgniRuntime => Status::OldAgniRuntime,
            LoadError::OldHost | LoadError::WrongHost => Status::OldHost,
            LoadError::ThreadsExhausted => Status::ThreadsExhausted,
        }
    }
}

/// A runtime fault raised while a thread is executing. Faults never
/// escape `run_scripts`: the scheduler clears the faulting thread's
/// executing flag and records the fault, per §7 ("faults in one
/// script thread do not tear down the VM").
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("stack overflow")]
    StackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("invalid coercion")]
    InvalidCoercion,
}

impl From<CoercionError> for Fault {
    fn from(_: CoercionError) -> Fault {
        Fault::InvalidCoercion
    }
}
