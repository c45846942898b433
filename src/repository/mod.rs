//! Epoch-partitioned constant-pool repositories.

pub mod context;
pub mod stacktrace;
pub mod symbols;
pub mod table;

pub use context::ContextRepository;
pub use stacktrace::{FrameKind, StackFrame, StackTraceRepository, MAX_FRAMES};
pub use symbols::SymbolRepository;
