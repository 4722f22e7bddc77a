use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Null pointer encountered")]
    NullPointer,

    #[error("Invalid target address {0:#x}")]
    InvalidTarget(usize),

    #[error("Prologue too short: need {needed} bytes, {available} available")]
    PrologueTooShort { needed: usize, available: usize },

    #[error("Memory protection failed: {0}")]
    MemoryProtection(String),

    #[error("Memory mapping failed: {0}")]
    MemoryMap(String),

    #[error("Generated code needs {needed} bytes, block holds {capacity}")]
    CodeTooLarge { needed: usize, capacity: usize },

    #[error("Displacement to {0:#x} does not fit in 32 bits")]
    DisplacementOutOfRange(usize),

    #[error("Target {0:#x} is already hooked")]
    AlreadyHooked(usize),

    #[error("Target {0:#x} is not hooked")]
    NotHooked(usize),

    #[error("No hook with entry {0:#x} is installed")]
    NotInstalled(usize),

    #[error("Hook {0:#x} is no longer the head of its chain")]
    NotChainHead(usize),

    #[error("Entry at {0:#x} changed while it was being patched")]
    EntryChanged(usize),

    #[error("Hook record at {0:#x} failed validation")]
    Corrupted(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HookError>;
