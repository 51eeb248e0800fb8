//! Fatal conditions raised while loading or executing a program.
//!
//! Every error is fatal to the run. The dispatch loop wraps whatever it
//! hits with the active call chain before handing it back to the embedder.

use crate::memory::Segment;
use serde::Serialize;
use thiserror::Error;

/// One activation record in an error's call-stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceFrame {
    pub function: String,
    pub pc: u32,
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("unsupported opcode {opcode:#04x} at code offset {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },
    #[error("unsupported conversion from {from} to type tag {to}")]
    UnsupportedConversion { from: &'static str, to: u32 },
    #[error("invalid type tag: {0}")]
    InvalidType(u32),
    #[error("invalid program header: {0}")]
    InvalidHeader(String),
    #[error("memory buffer too small: layout needs {required} bytes, got {actual}")]
    MemoryTooSmall { required: usize, actual: usize },
    #[error("malformed metadata at const address {addr}: {reason}")]
    MalformedMetadata { addr: u32, reason: String },
    #[error("stack overflow: call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("stack underflow: return from the base frame")]
    StackUnderflow,
    #[error("out of memory: cannot allocate {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("{segment} access out of bounds: offset {offset}, length {len}")]
    SegmentOutOfBounds {
        segment: Segment,
        offset: usize,
        len: usize,
    },
    #[error("register out of bounds: {0}")]
    RegisterOutOfBounds(usize),
    #[error(
        "field offset {offset} (width {width}) out of bounds for heap entry {addr} \
         with data size {data_size}"
    )]
    FieldOutOfBounds {
        addr: u32,
        offset: usize,
        width: usize,
        data_size: u32,
    },
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("nil dereference")]
    NilDereference,
    #[error("no override of virtual function {virtual_function} in type '{type_name}'")]
    MissingOverride {
        type_name: String,
        virtual_function: u32,
    },
    #[error("unknown built-in function id: {0}")]
    UnknownBuiltIn(u32),
    #[error("division by zero")]
    DivisionByZero,
    #[error("reference count underflow on heap entry {0}")]
    RefCountUnderflow(u32),
    #[error("{message}\nStack trace (most recent call last):{stack_trace}")]
    WithStackTrace {
        message: String,
        stack_trace: String,
        frames: Vec<TraceFrame>,
    },
}

impl VmError {
    /// Attach a call-stack trace, returning a `WithStackTrace` variant.
    /// Empty traces and already wrapped errors are returned unchanged.
    pub fn with_stack_trace(self, frames: Vec<TraceFrame>) -> Self {
        if frames.is_empty() || matches!(self, VmError::WithStackTrace { .. }) {
            return self;
        }
        let message = self.to_string();
        let stack_trace = Self::format_stack_trace(&frames);
        VmError::WithStackTrace {
            message,
            stack_trace,
            frames,
        }
    }

    /// Render frames oldest first, one per line.
    pub fn format_stack_trace(frames: &[TraceFrame]) -> String {
        frames
            .iter()
            .enumerate()
            .map(|(i, frame)| format!("\n  #{}: {} (pc {})", i, frame.function, frame.pc))
            .collect()
    }

    /// The error with any stack-trace wrapper peeled off, rendered.
    pub fn message(&self) -> String {
        match self {
            VmError::WithStackTrace { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Check if the message contains `needle` (looks through the trace wrapper).
    pub fn message_contains(&self, needle: &str) -> bool {
        self.message().contains(needle)
    }

    pub fn frames(&self) -> &[TraceFrame] {
        match self {
            VmError::WithStackTrace { frames, .. } => frames,
            _ => &[],
        }
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.message_contains("out of memory")
    }

    pub fn is_stack_overflow(&self) -> bool {
        self.message_contains("stack overflow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_trace_wraps_once() {
        let frames = vec![
            TraceFrame {
                function: "main".into(),
                pc: 12,
            },
            TraceFrame {
                function: "f".into(),
                pc: 4,
            },
        ];
        let err = VmError::DivisionByZero.with_stack_trace(frames.clone());
        let rendered = err.to_string();
        assert!(rendered.starts_with("division by zero"));
        assert!(rendered.contains("#0: main (pc 12)"));
        assert!(rendered.contains("#1: f (pc 4)"));

        let again = err.with_stack_trace(frames);
        assert_eq!(again.frames().len(), 2);
        assert!(again.message_contains("division by zero"));
    }

    #[test]
    fn empty_trace_leaves_error_alone() {
        let err = VmError::StackOverflow(8).with_stack_trace(Vec::new());
        assert!(matches!(err, VmError::StackOverflow(8)));
        assert!(err.is_stack_overflow());
        assert!(err.frames().is_empty());
    }
}
