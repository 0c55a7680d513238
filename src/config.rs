//! Translator configuration.

/// Configuration of the dynamic compiler
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Blocks are closed after this many guest instructions even without a branch
    pub max_block_instructions: usize,
    /// Logs every decoded guest instruction at trace level
    pub trace_instructions: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            max_block_instructions: 64,
            trace_instructions: false,
        }
    }
}
