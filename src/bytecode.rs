//! Stack-machine instruction set, constant pool, and the linear byte-stream
//! encoding consumed by the interpreter.
//!
//! Operand encoding is fixed: a 1-byte opcode, a 1-byte unsigned arity/count
//! where an instruction needs one, and 2-byte big-endian operands for
//! constant/local/global indices and branch offsets.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    PushConst = 0,
    Pop = 1,
    Dup = 2,
    PushNull = 3,
    PushTrue = 4,
    PushFalse = 5,
    PushZero = 6,
    PushOne = 7,
    Add = 8,
    Sub = 9,
    Mul = 10,
    Div = 11,
    Mod = 12,
    Neg = 13,
    BitAnd = 14,
    BitOr = 15,
    BitXor = 16,
    BitNot = 17,
    Shl = 18,
    Shr = 19,
    Eq = 20,
    Ne = 21,
    Lt = 22,
    Le = 23,
    Gt = 24,
    Ge = 25,
    Not = 26,
    And = 27,
    Or = 28,
    LoadLocal = 29,
    StoreLocal = 30,
    LoadGlobal = 31,
    StoreGlobal = 32,
    Jump = 33,
    JumpIfTrue = 34,
    JumpIfFalse = 35,
    LoopJump = 36,
    Call = 37,
    CallMethod = 38,
    CallStatic = 39,
    Return = 40,
    NewObject = 41,
    GetField = 42,
    SetField = 43,
    MakeArray = 44,
    ArrayGet = 45,
    ArraySet = 46,
    ArrayLen = 47,
    MakeMap = 48,
    MapGet = 49,
    MapSet = 50,
    MakeSuperArray = 51,
    IterInit = 52,
    IterNext = 53,
    IterKey = 54,
    IterValue = 55,
    Cast = 56,
    CastSafe = 57,
    Closure = 58,
    Spawn = 59,
    ChannelNew = 60,
    Send = 61,
    Receive = 62,
}

impl Op {
    pub fn from_byte(b: u8) -> Result<Op, RuntimeError> {
        use Op::*;
        let op = match b {
            0 => PushConst,
            1 => Pop,
            2 => Dup,
            3 => PushNull,
            4 => PushTrue,
            5 => PushFalse,
            6 => PushZero,
            7 => PushOne,
            8 => Add,
            9 => Sub,
            10 => Mul,
            11 => Div,
            12 => Mod,
            13 => Neg,
            14 => BitAnd,
            15 => BitOr,
            16 => BitXor,
            17 => BitNot,
            18 => Shl,
            19 => Shr,
            20 => Eq,
            21 => Ne,
            22 => Lt,
            23 => Le,
            24 => Gt,
            25 => Ge,
            26 => Not,
            27 => And,
            28 => Or,
            29 => LoadLocal,
            30 => StoreLocal,
            31 => LoadGlobal,
            32 => StoreGlobal,
            33 => Jump,
            34 => JumpIfTrue,
            35 => JumpIfFalse,
            36 => LoopJump,
            37 => Call,
            38 => CallMethod,
            39 => CallStatic,
            40 => Return,
            41 => NewObject,
            42 => GetField,
            43 => SetField,
            44 => MakeArray,
            45 => ArrayGet,
            46 => ArraySet,
            47 => ArrayLen,
            48 => MakeMap,
            49 => MapGet,
            50 => MapSet,
            51 => MakeSuperArray,
            52 => IterInit,
            53 => IterNext,
            54 => IterKey,
            55 => IterValue,
            56 => Cast,
            57 => CastSafe,
            58 => Closure,
            59 => Spawn,
            60 => ChannelNew,
            61 => Send,
            62 => Receive,
            other => {
                return Err(RuntimeError::CorruptBytecode {
                    detail: format!("invalid opcode byte {other}"),
                })
            }
        };
        Ok(op)
    }
}

/// An entry in a function's constant pool. `FunctionRef` resolves, at load
/// time, to the `Arc<Function>` registered under that id in the image's
/// function table — constants never embed heap values directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConstValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    FunctionRef(u32),
}

/// An `(isLocal, index)` upvalue capture descriptor read by `Op::Closure`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UpvalDesc {
    pub is_local: bool,
    pub index: u16,
}

/// A function's compiled body: the linear byte stream plus its constant
/// pool and upvalue descriptor table. Functions reference this through
/// `CodeRef` so closures over the same function body share one copy.
#[derive(Debug, Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<ConstValue>,
    pub upvalues: Vec<UpvalDesc>,
    /// Source line for each instruction's first byte, parallel to jump
    /// targets by offset; empty when the image carries no debug info.
    pub line_info: Vec<(usize, u32)>,
}

pub type CodeRef = Arc<Chunk>;

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    pub fn add_constant(&mut self, value: ConstValue) -> u16 {
        self.constants.push(value);
        (self.constants.len() - 1) as u16
    }

    pub fn emit_op(&mut self, op: Op) -> usize {
        let at = self.code.len();
        self.code.push(op as u8);
        at
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    pub fn emit_i16(&mut self, value: i16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    /// Emits a forward jump with a placeholder offset and returns the byte
    /// position of that placeholder, for later `patch_jump`.
    pub fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        let at = self.code.len();
        self.emit_i16(0);
        at
    }

    pub fn patch_jump(&mut self, placeholder_at: usize) {
        let target = self.code.len() as i16 - placeholder_at as i16 - 2;
        self.code[placeholder_at..placeholder_at + 2].copy_from_slice(&target.to_be_bytes());
    }

    pub fn read_u8(&self, ip: usize) -> u8 {
        self.code[ip]
    }

    pub fn read_u16(&self, ip: usize) -> u16 {
        u16::from_be_bytes([self.code[ip], self.code[ip + 1]])
    }

    pub fn read_i16(&self, ip: usize) -> i16 {
        i16::from_be_bytes([self.code[ip], self.code[ip + 1]])
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut ip = 0usize;
        while ip < self.code.len() {
            let start = ip;
            let op = match Op::from_byte(self.code[ip]) {
                Ok(op) => op,
                Err(_) => {
                    out.push_str(&format!("{start:04} <bad opcode {}>\n", self.code[ip]));
                    ip += 1;
                    continue;
                }
            };
            ip += 1;
            let operand_len = operand_byte_len(op);
            let mut operands = Vec::new();
            for _ in 0..operand_len {
                operands.push(self.code.get(ip).copied().unwrap_or(0));
                ip += 1;
            }
            out.push_str(&format!("{start:04} {op:?} {operands:?}\n"));
        }
        out
    }
}

/// Number of operand bytes following the opcode byte, for disassembly and
/// for the interpreter's advance-past-operands step on the slow path.
/// `Op::Closure` is variable length and handled specially by the
/// interpreter, not through this table.
fn operand_byte_len(op: Op) -> usize {
    use Op::*;
    match op {
        PushConst | LoadLocal | StoreLocal | LoadGlobal | StoreGlobal | Jump | JumpIfTrue
        | JumpIfFalse | LoopJump | GetField | SetField | NewObject | Cast | CastSafe => 2,
        CallMethod => 3,
        CallStatic => 5,
        Call | MakeArray | MakeMap | MakeSuperArray | Spawn | ChannelNew => 1,
        Closure => 2,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_patch_computes_relative_offset() {
        let mut chunk = Chunk::new();
        let placeholder = chunk.emit_jump(Op::Jump);
        chunk.emit_op(Op::PushNull);
        chunk.emit_op(Op::PushNull);
        chunk.patch_jump(placeholder);
        let target = chunk.read_i16(placeholder);
        assert_eq!(target, 2);
    }

    #[test]
    fn opcode_roundtrips_through_byte() {
        for b in 0..=62u8 {
            let op = Op::from_byte(b).unwrap();
            assert_eq!(op as u8, b);
        }
        assert!(Op::from_byte(255).is_err());
    }
}
