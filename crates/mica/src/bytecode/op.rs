//! Opcode definitions.
//!
//! One-byte opcode followed by opcode-specific operands. Register operands
//! are window-relative u8; constant, global-name, and prototype indices
//! are u16 big-endian; jump offsets are i16 big-endian relative to the
//! byte immediately after the offset.

use strum::FromRepr;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub(crate) enum Opcode {
    Nop,
    /// k:u16 d -> R\[d\] ← constants\[k\]
    LoadConst,
    /// i d -> R\[d\] ← R\[i\]
    LoadLocal,
    /// i s -> R\[i\] ← R\[s\]
    StoreLocal,
    /// s d -> R\[d\] ← R\[s\]
    Move,
    /// u d -> read through the closure's upvalue cell
    LoadUpval,
    /// u s -> write through the closure's upvalue cell
    StoreUpval,
    /// k:u16 d -> global lookup with native-registry fallback
    LoadGlobal,
    /// k:u16 s -> insert or overwrite a global
    StoreGlobal,
    /// a b d -> int if both int, else float with promotion
    Add,
    Sub,
    Mul,
    Div,
    /// a b d -> integer remainder
    Mod,
    /// s d -> arithmetic negation
    Neg,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// off:i16
    Jump,
    /// r off:i16 -> jump when R\[r\] is truthy
    JumpIf,
    /// r off:i16 -> jump when R\[r\] is falsy
    JumpIfNot,
    /// f n d -> call R\[f\] with args in R\[f+1..f+1+n\], result to R\[d\]
    Call,
    /// n \[r\] -> return (r present when n = 1)
    Ret,
    /// p:u16 d u:u16 (is_local idx)×u -> build a closure capturing upvalues
    Closure,
    /// i -> close open upvalues at or above register i
    CloseUpval,
    /// cap d -> fresh array with initial capacity
    ArrayNew,
    /// a i d -> bounds-checked read
    ArrayGet,
    /// a i s -> bounds-checked write
    ArraySet,
    /// a d -> length as an integer
    ArrayLen,
    /// a v -> append, growing by doubling
    ArrayPush,
    /// s d -> iterator over R\[s\]
    IterNew,
    /// it d -> advance; none when exhausted
    IterNext,
    /// it d -> boolean
    IterHasNext,
}
