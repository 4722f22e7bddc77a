pub mod chain;
pub mod context;
pub mod memory;
pub mod pool;
pub mod record;
pub mod target;
pub mod trampoline;
