// =============================================================================
// OP - Bytecode instructions
// =============================================================================
//
// One opcode byte, followed by its operands. Operands are single bytes or
// big-endian u16 pairs; `operand_width` gives the total per opcode. Jump
// offsets are relative to the first byte after the operands.

use crate::process::CallFlags;

/// Bytecode opcode.
///
/// Stack effects are written as `( before -- after )`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // ─────────────────────────── Stack operations ───────────────────────
    Nop,
    /// `( x -- )`
    Pop,
    /// `PopN n`: `( x1 .. xn -- )`
    PopN,
    /// `Unwind n`: drop `n` values below the top. `( x1 .. xn v -- v )`
    Unwind,
    /// `Const k`: `( -- constants[k] )`
    Const,
    /// `Load slot`: `( -- locals[slot] )`
    Load,
    /// `Store slot`: write the top into a local without popping it.
    /// `( v -- v )`
    Store,
    /// `LoadCapture i`: `( -- env[i] )`
    LoadCapture,
    /// `StoreCapture i`: `( v -- v )`
    StoreCapture,
    /// `MakeCell slot`: move the local into a fresh shared cell. Later
    /// accesses to the slot go through `LoadCell` and `StoreCell`.
    MakeCell,
    /// `LoadCell slot`: `( -- cell[slot] )`
    LoadCell,
    /// `StoreCell slot`: `( v -- v )`
    StoreCell,
    /// `CaptureLocal slot`: queue the cell of a local for the next
    /// `MakeClosure`.
    CaptureLocal,
    /// `CaptureOuter i`: queue `env[i]` for the next `MakeClosure`.
    CaptureOuter,

    // ─────────────────────────── Indexing ───────────────────────────────
    /// `( target index -- value )`
    Index,
    /// `( value target index -- value )`
    IndexStore,

    // ─────────────────────────── Operators ──────────────────────────────
    /// `( a b -- a+b )`
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    /// `( x -- -x )`
    Negate,
    Not,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    /// `( needle haystack -- bool )`
    Contains,
    /// `Cast type`: `( x -- x as type )`
    Cast,

    // ─────────────────────────── Builders ───────────────────────────────
    /// `BuildList n`: `( x1 .. xn -- list )`
    BuildList,
    BuildTuple,
    /// `BuildDict n`: `( k1 v1 .. kn vn -- dict )`
    BuildDict,
    BuildSet,
    /// `BuildRange flags`: pops the bounds named by the flags.
    BuildRange,
    /// `BuildString n`: concatenate the string forms of `n` values.
    BuildString,
    /// `BuildStruct k`: `constants[k]` is the shape; pops one value per field.
    BuildStruct,
    /// `Unpack n`: `( seq -- x1 .. xn )`
    Unpack,
    /// `MakeClosure k n`: `( -- closure )` for the page in `constants[k]`,
    /// taking the last `n` queued cells as its environment.
    MakeClosure,

    // ─────────────────────────── Jumps ──────────────────────────────────
    Jump,
    JumpBackward,
    /// Jump if the top is truthy. Does not pop.
    JumpIf,
    /// Jump if the top is falsy. Does not pop.
    JumpIfNot,
    /// `( cond -- )`
    PopJumpIf,
    PopJumpIfNot,

    // ─────────────────────────── Iteration ──────────────────────────────
    /// `( iterable -- )` and push an iterator on the iterator stack.
    GetIter,
    /// `ForIter offset`: `( -- item )`, or jump past the loop when the
    /// iterator is exhausted.
    ForIter,
    /// Drop the innermost iterator.
    EndFor,

    // ─────────────────────────── Calls ──────────────────────────────────
    /// `Call argc`: `( f a1 .. an -- result )`
    Call,
    RootCall,
    MaybeRootCall,
    /// `CallStd k argc`: `( a1 .. an -- result )`
    CallStd,
    /// `CallProgram argc flags envc`:
    /// `( name a1 .. an [piped] k1 v1 .. km vm -- result )`
    CallProgram,
    RootCallProgram,
    MaybeRootCallProgram,
    /// Leave the current page.
    Ret,

    // ─────────────────────────── Error boundaries ───────────────────────
    /// `Try offset`: enter a try region whose catch block starts at the
    /// target.
    Try,
    EndTry,
}

impl Op {
    /// Every opcode in discriminant order.
    pub const ALL: [Op; 62] = [
        Op::Nop,
        Op::Pop,
        Op::PopN,
        Op::Unwind,
        Op::Const,
        Op::Load,
        Op::Store,
        Op::LoadCapture,
        Op::StoreCapture,
        Op::MakeCell,
        Op::LoadCell,
        Op::StoreCell,
        Op::CaptureLocal,
        Op::CaptureOuter,
        Op::Index,
        Op::IndexStore,
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::Pow,
        Op::Negate,
        Op::Not,
        Op::Equal,
        Op::NotEqual,
        Op::Less,
        Op::LessEqual,
        Op::Greater,
        Op::GreaterEqual,
        Op::And,
        Op::Or,
        Op::Contains,
        Op::Cast,
        Op::BuildList,
        Op::BuildTuple,
        Op::BuildDict,
        Op::BuildSet,
        Op::BuildRange,
        Op::BuildString,
        Op::BuildStruct,
        Op::Unpack,
        Op::MakeClosure,
        Op::Jump,
        Op::JumpBackward,
        Op::JumpIf,
        Op::JumpIfNot,
        Op::PopJumpIf,
        Op::PopJumpIfNot,
        Op::GetIter,
        Op::ForIter,
        Op::EndFor,
        Op::Call,
        Op::RootCall,
        Op::MaybeRootCall,
        Op::CallStd,
        Op::CallProgram,
        Op::RootCallProgram,
        Op::MaybeRootCallProgram,
        Op::Ret,
        Op::Try,
        Op::EndTry,
    ];

    /// Number of operand bytes following the opcode.
    pub fn operand_width(self) -> usize {
        use Op::*;
        match self {
            PopN | Unwind | Load | Store | LoadCapture | StoreCapture | MakeCell | LoadCell
            | StoreCell | CaptureLocal | CaptureOuter | Cast | BuildRange | Unpack | Call
            | RootCall | MaybeRootCall => 1,

            Const | BuildList | BuildTuple | BuildDict | BuildSet | BuildString | BuildStruct
            | Jump | JumpBackward | JumpIf | JumpIfNot | PopJumpIf | PopJumpIfNot | ForIter
            | Try => 2,

            MakeClosure | CallStd => 3,

            CallProgram | RootCallProgram | MaybeRootCallProgram => 4,

            _ => 0,
        }
    }

    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Op::Jump
                | Op::JumpBackward
                | Op::JumpIf
                | Op::JumpIfNot
                | Op::PopJumpIf
                | Op::PopJumpIfNot
                | Op::ForIter
                | Op::Try
        )
    }

    /// Returns (pops, pushes) for an instruction given its operand bytes,
    /// or `None` when the effect depends on something outside the
    /// instruction (the struct shape, or control leaving the page).
    pub fn stack_effect(self, operands: &[u8]) -> Option<(usize, usize)> {
        use Op::*;
        let byte = |i: usize| operands.get(i).copied().map(usize::from);
        let word = |i: usize| Some(usize::from(read_u16(operands, i)?));

        Some(match self {
            Nop | Jump | JumpBackward | JumpIf | JumpIfNot | EndFor | Try | EndTry | MakeCell
            | CaptureLocal | CaptureOuter => (0, 0),
            Pop | PopJumpIf | PopJumpIfNot | GetIter => (1, 0),
            PopN => (byte(0)?, 0),
            Unwind => (byte(0)? + 1, 1),
            Const | Load | LoadCapture | LoadCell | ForIter | MakeClosure => (0, 1),
            Store | StoreCapture | StoreCell => (1, 1),

            Index => (2, 1),
            IndexStore => (3, 1),

            Add | Sub | Mul | Div | Mod | Pow | Equal | NotEqual | Less | LessEqual | Greater
            | GreaterEqual | And | Or | Contains => (2, 1),
            Negate | Not | Cast => (1, 1),

            BuildList | BuildTuple | BuildSet | BuildString => (word(0)?, 1),
            BuildDict => (word(0)? * 2, 1),
            BuildRange => {
                let flags = operands.first().copied()?;
                let bounds = usize::from(flags & RANGE_HAS_FROM != 0)
                    + usize::from(flags & RANGE_HAS_TO != 0);
                (bounds, 1)
            }
            Unpack => (1, byte(0)?),

            Call | RootCall | MaybeRootCall => (byte(0)? + 1, 1),
            CallStd => (byte(2)?, 1),
            CallProgram | RootCallProgram | MaybeRootCallProgram => {
                let argc = byte(0)?;
                let flags = read_u16(operands, 1)?;
                let envc = byte(3)?;
                let piped =
                    usize::from(CallFlags::from_bits(flags).contains(CallFlags::HAS_PIPED_VALUE));
                (1 + argc + piped + envc * 2, 1)
            }

            BuildStruct | Ret => return None,
        })
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Op::ALL.get(usize::from(byte)).copied().ok_or(byte)
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// `BuildRange` flag bits.
pub const RANGE_HAS_FROM: u8 = 1 << 0;
pub const RANGE_HAS_TO: u8 = 1 << 1;
pub const RANGE_INCLUSIVE: u8 = 1 << 2;

pub fn read_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let hi = *bytes.get(at)?;
    let lo = *bytes.get(at + 1)?;
    Some(u16::from_be_bytes([hi, lo]))
}

/// One decoded instruction of a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub offset: usize,
    pub op: Op,
    pub operands: &'a [u8],
}

impl Instruction<'_> {
    /// Offset of the first byte after the operands.
    pub fn next_offset(&self) -> usize {
        self.offset + 1 + self.operands.len()
    }

    pub fn byte(&self, i: usize) -> u8 {
        self.operands.get(i).copied().unwrap_or(0)
    }

    pub fn word(&self, i: usize) -> u16 {
        read_u16(self.operands, i).unwrap_or(0)
    }

    /// Absolute target of a jump instruction.
    pub fn jump_target(&self) -> Option<usize> {
        if !self.op.is_jump() {
            return None;
        }
        let distance = usize::from(self.word(0));
        if self.op == Op::JumpBackward {
            self.next_offset().checked_sub(distance)
        } else {
            Some(self.next_offset() + distance)
        }
    }
}

/// Decode a byte stream. Yields `Err((offset, byte))` on an unknown
/// opcode or truncated operands and stops.
pub fn instructions(code: &[u8]) -> impl Iterator<Item = Result<Instruction<'_>, (usize, u8)>> {
    let mut offset = 0;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed || offset >= code.len() {
            return None;
        }
        let byte = code[offset];
        let decoded = Op::try_from(byte).ok().and_then(|op| {
            let end = offset + 1 + op.operand_width();
            code.get(offset + 1..end).map(|operands| Instruction {
                offset,
                op,
                operands,
            })
        });
        match decoded {
            Some(instruction) => {
                offset = instruction.next_offset();
                Some(Ok(instruction))
            }
            None => {
                failed = true;
                Some(Err((offset, byte)))
            }
        }
    })
}
