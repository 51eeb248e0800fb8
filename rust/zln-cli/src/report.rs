//! Machine-readable results for `zln run --json` and `zln validate --json`.

use serde::Serialize;
use zln_vm::heap::{HeapEntry, HeapView};
use zln_vm::{MemoryLayout, ProgramHeader, TraceFrame, Type, VmError};

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub file: String,
    pub success: bool,
    pub steps: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap_offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    pub output: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap: Option<Vec<HeapEntryReport>>,
}

#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub stack_trace: Vec<TraceFrame>,
}

impl From<&VmError> for ErrorReport {
    fn from(err: &VmError) -> Self {
        Self {
            message: err.message(),
            stack_trace: err.frames().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HeapEntryReport {
    #[serde(flatten)]
    pub entry: HeapEntry,
    pub type_name: String,
    /// Contents of byte arrays, lossily decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidateReport {
    pub file: String,
    pub valid: bool,
    pub header: ProgramHeader,
    pub layout: MemoryLayout,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot every live and free entry left in the heap.
pub fn heap_entries(view: &HeapView<'_>) -> Result<Vec<HeapEntryReport>, VmError> {
    view.entries()?
        .into_iter()
        .map(|entry| {
            let type_name = view.type_name(&entry)?;
            let text = match entry.element_type() {
                Some(Type::Unsigned8) => Some(view.read_string(entry.addr)?),
                _ => None,
            };
            Ok(HeapEntryReport {
                entry,
                type_name,
                text,
            })
        })
        .collect()
}
