//! Program container: the fixed header, the embedding entry point and a
//! loader for program images.
//!
//! An image is the 40-byte header followed by the code segment and the
//! const segment, optionally followed by initial global values.

use crate::error::VmError;
use crate::heap::{HeapView, HEAP_RESERVED_BYTES};
use crate::memory::{self, Addr, MemoryLayout, Segment};
use crate::vm::{self, RuntimeConfig};
use serde::Serialize;
use tracing::info;

pub const MAGIC: [u8; 2] = *b"ZL";
pub const MAJOR_VERSION: u8 = 0;
pub const MINOR_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 40;
/// Heap size used when neither the header nor the caller picks one.
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024;

const _: () = assert!(HEADER_SIZE == 4 + 4 * 9);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgramHeader {
    pub magic: [u8; 2],
    pub major_version: u8,
    pub minor_version: u8,
    pub code_segment_size: u32,
    pub const_segment_size: u32,
    pub global_segment_size: u32,
    pub entry_point_address: Addr,
    pub register_count: u32,
    pub max_stack_depth: u32,
    /// Heap cap in bytes; 0 lets the heap take the rest of the buffer.
    pub max_heap_size: u32,
    pub reserved: [u32; 2],
}

impl ProgramHeader {
    /// Header for the current format version.
    pub fn new(layout: &MemoryLayout, entry_point_address: Addr) -> Self {
        Self {
            magic: MAGIC,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            code_segment_size: layout.code_segment_size,
            const_segment_size: layout.const_segment_size,
            global_segment_size: layout.global_segment_size,
            entry_point_address,
            register_count: layout.register_count,
            max_stack_depth: layout.max_stack_depth,
            max_heap_size: layout.max_heap_size,
            reserved: [0; 2],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VmError> {
        if bytes.len() < HEADER_SIZE {
            return Err(VmError::InvalidHeader(format!(
                "expected {} header bytes, found {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let field = |i: usize| memory::read_u32(bytes, Segment::Code, 4 + i * 4);
        Ok(Self {
            magic: [bytes[0], bytes[1]],
            major_version: bytes[2],
            minor_version: bytes[3],
            code_segment_size: field(0)?,
            const_segment_size: field(1)?,
            global_segment_size: field(2)?,
            entry_point_address: field(3)?,
            register_count: field(4)?,
            max_stack_depth: field(5)?,
            max_heap_size: field(6)?,
            reserved: [field(7)?, field(8)?],
        })
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..2].copy_from_slice(&self.magic);
        out[2] = self.major_version;
        out[3] = self.minor_version;
        let fields = [
            self.code_segment_size,
            self.const_segment_size,
            self.global_segment_size,
            self.entry_point_address,
            self.register_count,
            self.max_stack_depth,
            self.max_heap_size,
            self.reserved[0],
            self.reserved[1],
        ];
        for (i, value) in fields.iter().enumerate() {
            out[4 + i * 4..8 + i * 4].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Magic and version bytes match this runtime exactly.
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
            && self.major_version == MAJOR_VERSION
            && self.minor_version == MINOR_VERSION
    }

    pub fn validate(&self) -> Result<(), VmError> {
        if self.is_valid() {
            return Ok(());
        }
        Err(VmError::InvalidHeader(format!(
            "magic {:?} version {}.{}, expected {:?} version {}.{}",
            String::from_utf8_lossy(&self.magic),
            self.major_version,
            self.minor_version,
            String::from_utf8_lossy(&MAGIC),
            MAJOR_VERSION,
            MINOR_VERSION
        )))
    }

    pub fn layout(&self) -> MemoryLayout {
        MemoryLayout {
            code_segment_size: self.code_segment_size,
            const_segment_size: self.const_segment_size,
            global_segment_size: self.global_segment_size,
            register_count: self.register_count,
            max_stack_depth: self.max_stack_depth,
            max_heap_size: self.max_heap_size,
        }
    }
}

/// Run a program already laid out in `memory` and return the byte offset
/// where its heap begins.
pub fn execute_program(
    header: &ProgramHeader,
    memory: &mut [u8],
    config: RuntimeConfig,
) -> Result<usize, VmError> {
    header.validate()?;
    let layout = header.layout();
    info!(
        code = layout.code_segment_size,
        consts = layout.const_segment_size,
        globals = layout.global_segment_size,
        registers = layout.register_count,
        stack_depth = layout.max_stack_depth,
        heap = memory.len().saturating_sub(layout.heap_offset()),
        entry = header.entry_point_address,
        "starting program"
    );
    vm::execute(memory, &layout, header.entry_point_address, config)?;
    Ok(layout.heap_offset())
}

/// A program copied into its own execution buffer.
#[derive(Debug, Clone)]
pub struct LoadedProgram {
    header: ProgramHeader,
    memory: Vec<u8>,
}

impl LoadedProgram {
    /// Parse an image file. `heap_size` overrides the header's heap cap.
    pub fn from_image(image: &[u8], heap_size: Option<usize>) -> Result<Self, VmError> {
        let header = ProgramHeader::decode(image)?;
        header.validate()?;
        let body = &image[HEADER_SIZE..];
        let layout = header.layout();
        let without_globals = layout.global_offset();
        let with_globals = layout.register_offset();
        if body.len() != without_globals && body.len() != with_globals {
            return Err(VmError::InvalidHeader(format!(
                "image body is {} bytes, header declares {} (or {} with globals)",
                body.len(),
                without_globals,
                with_globals
            )));
        }
        Self::from_segments(header, body, heap_size)
    }

    /// Build the execution buffer from code and const bytes laid back to
    /// back, optionally followed by initial globals.
    pub fn from_segments(
        header: ProgramHeader,
        segments: &[u8],
        heap_size: Option<usize>,
    ) -> Result<Self, VmError> {
        let layout = header.layout();
        let declared = layout.register_offset();
        if segments.len() > declared {
            return Err(VmError::InvalidHeader(format!(
                "{} segment bytes exceed the declared {}",
                segments.len(),
                declared
            )));
        }
        let mut header = header;
        let heap_size = match heap_size {
            Some(size) => {
                let size = size.max(HEAP_RESERVED_BYTES);
                // The layout caps the heap at `max_heap_size`, so the
                // override has to land in the header as well.
                header.max_heap_size = u32::try_from(size).map_err(|_| {
                    VmError::InvalidHeader(format!("heap size {} does not fit in u32", size))
                })?;
                size
            }
            None => match header.max_heap_size {
                0 => DEFAULT_HEAP_SIZE,
                cap => (cap as usize).max(HEAP_RESERVED_BYTES),
            },
        };
        let mut memory = vec![0u8; layout.heap_offset() + heap_size];
        memory[..segments.len()].copy_from_slice(segments);
        Ok(Self { header, memory })
    }

    /// Execute from the entry point. Returns the heap offset.
    pub fn run(&mut self, config: RuntimeConfig) -> Result<usize, VmError> {
        execute_program(&self.header, &mut self.memory, config)
    }

    pub fn header(&self) -> &ProgramHeader {
        &self.header
    }

    pub fn layout(&self) -> MemoryLayout {
        self.header.layout()
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn code(&self) -> &[u8] {
        &self.memory[..self.layout().const_offset()]
    }

    pub fn consts(&self) -> &[u8] {
        let layout = self.layout();
        &self.memory[layout.const_offset()..layout.global_offset()]
    }

    pub fn globals(&self) -> &[u8] {
        let layout = self.layout();
        &self.memory[layout.global_offset()..layout.register_offset()]
    }

    /// Heap contents as left by the last run.
    pub fn heap(&self) -> HeapView<'_> {
        let layout = self.layout();
        let start = layout.heap_offset();
        let end = match layout.max_heap_size {
            0 => self.memory.len(),
            cap => self.memory.len().min(start + cap as usize),
        };
        HeapView::new(&self.memory[start..end], self.consts())
    }

    pub fn global_i32(&self, offset: usize) -> Result<i32, VmError> {
        memory::read_i32(self.globals(), Segment::Global, offset)
    }

    pub fn global_f64(&self, offset: usize) -> Result<f64, VmError> {
        memory::read_f64(self.globals(), Segment::Global, offset)
    }

    pub fn global_u8(&self, offset: usize) -> Result<u8, VmError> {
        memory::read_u8(self.globals(), Segment::Global, offset)
    }

    pub fn global_ref(&self, offset: usize) -> Result<Addr, VmError> {
        memory::read_u32(self.globals(), Segment::Global, offset)
    }
}
