pub mod assembler;
pub mod prompt;

pub use assembler::{AssembledPrompt, AssemblerConfig, ContextAssembler};
pub use prompt::StyleRule;
