//! Treeline Codex - spawns the external code-generation CLI and streams its
//! JSONL event output.

pub mod process;
pub mod runner;

pub use process::terminate_process_group;
pub use runner::{
    CodexRunOutcome, CodexRunner, PidCallback, StreamCallback, TerminationChecker,
    DEFAULT_CODEX_ARGV,
};
