//! Opcode numbering, operand shapes and instruction encoding.
//!
//! Instructions are variable-length: a one-byte opcode followed by an
//! operand tail whose shape is fixed per opcode. Register operands are one
//! byte, immediates and addresses four bytes (little-endian).

use crate::error::VmError;
use crate::types::Type;
use std::fmt;
use strum::{FromRepr, IntoStaticStr};

/// Opcodes of the zln register VM. The numbering is the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
#[repr(u8)]
pub enum OpCode {
    Nop = 0,

    // Globals: A = target, imm = global address
    LdGlbI32 = 1,
    LdGlbF64 = 2,
    LdGlbU8 = 3,
    LdGlbRef = 4,
    LdGlbPtr = 5,

    // Fields: A = target, B = heap address register, imm = byte offset
    LdFldI32 = 6,
    LdFldF64 = 7,
    LdFldU8 = 8,
    LdFldRef = 9,
    LdFldPtr = 10,

    // Elements: A = target, B = heap address register, C = index register
    LdElemI32 = 11,
    LdElemF64 = 12,
    LdElemU8 = 13,
    LdElemRef = 14,
    LdElemPtr = 15,

    // Stores mirror the loads with A as the source register
    StGlbI32 = 16,
    StGlbF64 = 17,
    StGlbU8 = 18,
    StGlbRef = 19,
    StGlbPtr = 20,
    StFldI32 = 21,
    StFldF64 = 22,
    StFldU8 = 23,
    StFldRef = 24,
    StFldPtr = 25,
    StElemI32 = 26,
    StElemF64 = 27,
    StElemU8 = 28,
    StElemRef = 29,
    StElemPtr = 30,

    LdcI32 = 31,  // A, imm: value
    LdcStr = 32,  // A, imm: const address of a zero-terminated string
    LdcF64 = 33,  // A, imm: const address of an f64
    LdcZero = 34, // A

    // Arithmetic: A = B op C
    AddI32 = 35,
    AddF64 = 36,
    AddU8 = 37,
    AddStr = 38,
    SubI32 = 39,
    SubF64 = 40,
    SubU8 = 41,
    MulI32 = 42,
    MulF64 = 43,
    MulU8 = 44,
    DivI32 = 45,
    DivF64 = 46,
    DivU8 = 47,

    // Comparison: A = (B op C) as 0/1
    EqI32 = 48,
    EqF64 = 49,
    EqU8 = 50,
    EqStr = 51,
    EqRef = 52,
    EqPtr = 53,
    NeI32 = 54,
    NeF64 = 55,
    NeU8 = 56,
    NeStr = 57,
    NeRef = 58,
    NePtr = 59,
    GtI32 = 60,
    GtF64 = 61,
    GtU8 = 62,
    GtStr = 63,
    GeI32 = 64,
    GeF64 = 65,
    GeU8 = 66,
    GeStr = 67,
    LtI32 = 68,
    LtF64 = 69,
    LtU8 = 70,
    LtStr = 71,
    LeI32 = 72,
    LeF64 = 73,
    LeU8 = 74,
    LeStr = 75,

    And = 76,    // A = B && C
    Or = 77,     // A = B || C
    Mov = 78,    // A = B
    BrZero = 79, // A, imm: branch to imm if A is zero
    Br = 80,     // imm: branch target
    Call = 81,   // A = result, B = first argument, imm = FunctionMeta
    Ret = 82,
    Halt = 83,

    // Conversion: A = convert(B as X) to type tag imm
    ConvI32 = 84,
    ConvF64 = 85,
    ConvU8 = 86,
    ConvStr = 87,
    ConvRef = 88,
    ConvPtr = 89,

    NewObj = 90, // A, imm: TypeMeta
    NewStr = 91, // A, imm: data size in bytes
    NewArrI32 = 92,
    NewArrF64 = 93,
    NewArrU8 = 94,
    NewArrRef = 95,
    NewArrPtr = 96,
    AddRef = 97,    // A
    RemoveRef = 98, // A
    Invoke = 99,    // A = result, B = first argument, imm = built-in id
    CallVirt = 100, // A = result, B = self, imm = virtual function
    TypeChk = 101,  // A = B is instance of TypeMeta imm

    ModI32 = 102,
    ModF64 = 103,
    ModU8 = 104,
    BandI32 = 105,
    BandU8 = 106,
    BorI32 = 107,
    BorU8 = 108,
    XorI32 = 109,
    XorU8 = 110,
    LShiftI32 = 111,
    LShiftU8 = 112,
    RShiftI32 = 113,
    RShiftU8 = 114,
}

/// Operand layout following the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    None,
    Reg,
    Reg2,
    Reg3,
    Imm,
    RegImm,
    Reg2Imm,
}

impl OperandShape {
    /// Encoded instruction length, opcode byte included.
    pub fn encoded_len(self) -> usize {
        match self {
            OperandShape::None => 1,
            OperandShape::Reg => 2,
            OperandShape::Reg2 => 3,
            OperandShape::Reg3 => 4,
            OperandShape::Imm => 5,
            OperandShape::RegImm => 6,
            OperandShape::Reg2Imm => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Band,
    Bor,
    Xor,
    LShift,
    RShift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn shape(self) -> OperandShape {
        use OpCode::*;
        match self {
            Nop | Ret | Halt => OperandShape::None,
            LdcZero | AddRef | RemoveRef => OperandShape::Reg,
            Mov | NewArrI32 | NewArrF64 | NewArrU8 | NewArrRef | NewArrPtr => OperandShape::Reg2,
            Br => OperandShape::Imm,
            LdGlbI32 | LdGlbF64 | LdGlbU8 | LdGlbRef | LdGlbPtr | StGlbI32 | StGlbF64
            | StGlbU8 | StGlbRef | StGlbPtr | LdcI32 | LdcStr | LdcF64 | BrZero | NewObj
            | NewStr => OperandShape::RegImm,
            LdFldI32 | LdFldF64 | LdFldU8 | LdFldRef | LdFldPtr | StFldI32 | StFldF64
            | StFldU8 | StFldRef | StFldPtr | Call | CallVirt | Invoke | TypeChk | ConvI32
            | ConvF64 | ConvU8 | ConvStr | ConvRef | ConvPtr => OperandShape::Reg2Imm,
            _ => OperandShape::Reg3,
        }
    }

    /// Primitive type named by the opcode's suffix, if it has one.
    pub fn value_type(self) -> Option<Type> {
        use OpCode::*;
        let ty = match self {
            LdGlbI32 | LdFldI32 | LdElemI32 | StGlbI32 | StFldI32 | StElemI32 | LdcI32 | AddI32
            | SubI32 | MulI32 | DivI32 | ModI32 | EqI32 | NeI32 | GtI32 | GeI32 | LtI32
            | LeI32 | ConvI32 | NewArrI32 | BandI32 | BorI32 | XorI32 | LShiftI32 | RShiftI32 => {
                Type::Int32
            }
            LdGlbF64 | LdFldF64 | LdElemF64 | StGlbF64 | StFldF64 | StElemF64 | LdcF64 | AddF64
            | SubF64 | MulF64 | DivF64 | ModF64 | EqF64 | NeF64 | GtF64 | GeF64 | LtF64
            | LeF64 | ConvF64 | NewArrF64 => Type::Float64,
            LdGlbU8 | LdFldU8 | LdElemU8 | StGlbU8 | StFldU8 | StElemU8 | AddU8 | SubU8
            | MulU8 | DivU8 | ModU8 | EqU8 | NeU8 | GtU8 | GeU8 | LtU8 | LeU8 | ConvU8
            | NewArrU8 | BandU8 | BorU8 | XorU8 | LShiftU8 | RShiftU8 => Type::Unsigned8,
            LdcStr | AddStr | EqStr | NeStr | GtStr | GeStr | LtStr | LeStr | ConvStr
            | NewStr => Type::String,
            LdGlbRef | LdFldRef | LdElemRef | StGlbRef | StFldRef | StElemRef | EqRef | NeRef
            | ConvRef | NewArrRef => Type::Ref,
            LdGlbPtr | LdFldPtr | LdElemPtr | StGlbPtr | StFldPtr | StElemPtr | EqPtr | NePtr
            | ConvPtr | NewArrPtr => Type::NativePtr,
            _ => return None,
        };
        Some(ty)
    }

    pub fn arith_op(self) -> Option<ArithOp> {
        use OpCode::*;
        let op = match self {
            AddI32 | AddF64 | AddU8 | AddStr => ArithOp::Add,
            SubI32 | SubF64 | SubU8 => ArithOp::Sub,
            MulI32 | MulF64 | MulU8 => ArithOp::Mul,
            DivI32 | DivF64 | DivU8 => ArithOp::Div,
            ModI32 | ModF64 | ModU8 => ArithOp::Mod,
            BandI32 | BandU8 => ArithOp::Band,
            BorI32 | BorU8 => ArithOp::Bor,
            XorI32 | XorU8 => ArithOp::Xor,
            LShiftI32 | LShiftU8 => ArithOp::LShift,
            RShiftI32 | RShiftU8 => ArithOp::RShift,
            _ => return None,
        };
        Some(op)
    }

    pub fn cmp_op(self) -> Option<CmpOp> {
        use OpCode::*;
        let op = match self {
            EqI32 | EqF64 | EqU8 | EqStr | EqRef | EqPtr => CmpOp::Eq,
            NeI32 | NeF64 | NeU8 | NeStr | NeRef | NePtr => CmpOp::Ne,
            GtI32 | GtF64 | GtU8 | GtStr => CmpOp::Gt,
            GeI32 | GeF64 | GeU8 | GeStr => CmpOp::Ge,
            LtI32 | LtF64 | LtU8 | LtStr => CmpOp::Lt,
            LeI32 | LeF64 | LeU8 | LeStr => CmpOp::Le,
            _ => return None,
        };
        Some(op)
    }
}

/// A decoded instruction. Unused operand fields are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: OpCode,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub imm: u32,
}

impl Instruction {
    pub fn none(op: OpCode) -> Self {
        Self {
            op,
            a: 0,
            b: 0,
            c: 0,
            imm: 0,
        }
    }

    pub fn reg(op: OpCode, a: u8) -> Self {
        Self { a, ..Self::none(op) }
    }

    pub fn reg2(op: OpCode, a: u8, b: u8) -> Self {
        Self { a, b, ..Self::none(op) }
    }

    pub fn reg3(op: OpCode, a: u8, b: u8, c: u8) -> Self {
        Self {
            a,
            b,
            c,
            ..Self::none(op)
        }
    }

    pub fn imm(op: OpCode, imm: u32) -> Self {
        Self {
            imm,
            ..Self::none(op)
        }
    }

    pub fn reg_imm(op: OpCode, a: u8, imm: u32) -> Self {
        Self {
            a,
            imm,
            ..Self::none(op)
        }
    }

    pub fn reg2_imm(op: OpCode, a: u8, b: u8, imm: u32) -> Self {
        Self {
            a,
            b,
            imm,
            ..Self::none(op)
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.op.shape().encoded_len()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.op as u8);
        match self.op.shape() {
            OperandShape::None => {}
            OperandShape::Reg => out.push(self.a),
            OperandShape::Reg2 => out.extend_from_slice(&[self.a, self.b]),
            OperandShape::Reg3 => out.extend_from_slice(&[self.a, self.b, self.c]),
            OperandShape::Imm => out.extend_from_slice(&self.imm.to_le_bytes()),
            OperandShape::RegImm => {
                out.push(self.a);
                out.extend_from_slice(&self.imm.to_le_bytes());
            }
            OperandShape::Reg2Imm => {
                out.extend_from_slice(&[self.a, self.b]);
                out.extend_from_slice(&self.imm.to_le_bytes());
            }
        }
    }

    /// Decode the instruction starting at `offset` of the code segment.
    pub fn decode(code: &[u8], offset: usize) -> Result<Self, VmError> {
        let byte = *code.get(offset).ok_or(VmError::SegmentOutOfBounds {
            segment: crate::memory::Segment::Code,
            offset,
            len: 1,
        })?;
        let op = OpCode::from_repr(byte).ok_or(VmError::UnsupportedOpcode {
            opcode: byte,
            offset,
        })?;
        let shape = op.shape();
        let raw = crate::memory::slice(
            code,
            crate::memory::Segment::Code,
            offset,
            shape.encoded_len(),
        )?;
        let imm_at =
            |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let instr = match shape {
            OperandShape::None => Self::none(op),
            OperandShape::Reg => Self::reg(op, raw[1]),
            OperandShape::Reg2 => Self::reg2(op, raw[1], raw[2]),
            OperandShape::Reg3 => Self::reg3(op, raw[1], raw[2], raw[3]),
            OperandShape::Imm => Self::imm(op, imm_at(1)),
            OperandShape::RegImm => Self::reg_imm(op, raw[1], imm_at(2)),
            OperandShape::Reg2Imm => Self::reg2_imm(op, raw[1], raw[2], imm_at(3)),
        };
        Ok(instr)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.op.name();
        match self.op.shape() {
            OperandShape::None => write!(f, "{}", name),
            OperandShape::Reg => write!(f, "{} r{}", name, self.a),
            OperandShape::Reg2 => write!(f, "{} r{}, r{}", name, self.a, self.b),
            OperandShape::Reg3 => write!(f, "{} r{}, r{}, r{}", name, self.a, self.b, self.c),
            OperandShape::Imm => write!(f, "{} {}", name, self.imm),
            OperandShape::RegImm => write!(f, "{} r{}, {}", name, self.a, self.imm),
            OperandShape::Reg2Imm => {
                write!(f, "{} r{}, r{}, {}", name, self.a, self.b, self.imm)
            }
        }
    }
}

/// Decode a whole code segment into `(offset, instruction)` pairs.
pub fn disassemble(code: &[u8]) -> Result<Vec<(usize, Instruction)>, VmError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let instr = Instruction::decode(code, offset)?;
        out.push((offset, instr));
        offset += instr.encoded_len();
    }
    Ok(out)
}
