use crate::format::ShaderStage;

/// A pre-built shader module.
///
/// `bytecode` is handed to the backend untouched (DXIL, SPIR-V, WGSL text, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderDesc {
    pub label: Option<String>,
    pub stage: ShaderStage,
    pub entry_point: String,
    pub bytecode: Vec<u8>,
}

impl ShaderDesc {
    pub fn new(stage: ShaderStage, entry_point: impl Into<String>, bytecode: impl Into<Vec<u8>>) -> Self {
        Self {
            label: None,
            stage,
            entry_point: entry_point.into(),
            bytecode: bytecode.into(),
        }
    }
}
