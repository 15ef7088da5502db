/// The compiled instruction set executed by a runner.
use serde::{Deserialize, Serialize};

use super::list::ListValue;

/// Index of an instruction in the story's flat instruction vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u32);

impl Address {
    pub fn next(self) -> Address {
        Address(self.0 + 1)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into the story's container table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub u32);

/// Index into the story's string table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterOrEqual,
    LessOrEqual,
    And,
    Or,
    Min,
    Max,
    /// `a ? b`
    Has,
    /// `a !? b`
    Hasnt,
    /// `a ^ b`
    Intersection,
    /// `RANDOM(min, max)`, inclusive.
    Random,
    /// `Origin(n)`: look a flag up by value in the origin of the left list.
    ListInt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
    ListCount,
    ListMin,
    ListMax,
    ListAll,
    ListInvert,
    ListValue,
    ListRandom,
    /// Visit count of the container a divert target points at.
    ReadCountOf,
    /// Turns since the container a divert target points at was entered.
    TurnsSince,
    Floor,
    Ceiling,
    IntCast,
    FloatCast,
}

/// Flags carried by a choice instruction. When present, the values sit on the
/// evaluation stack with the condition on top, then start content, then
/// choice-only content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChoiceFlags {
    pub has_condition: bool,
    pub has_start_content: bool,
    pub has_choice_only_content: bool,
    pub invisible_default: bool,
    pub once_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    // Content
    Text(StrId),
    Newline,
    Glue,
    Tag(StrId),
    BeginTag,
    EndTag,
    BeginString,
    EndString,
    /// Pop a value and write it to the output.
    Output,

    // Evaluation stack
    PushBool(bool),
    PushInt(i32),
    PushFloat(f32),
    PushString(StrId),
    PushList(ListValue),
    PushDivert(Address),
    Void,
    Pop,
    Duplicate,
    Binary(BinaryOp),
    Unary(UnaryOp),
    /// Pops max, min and a list; pushes the flags whose value is in range.
    ListRange,

    // Variables
    PushVariable(StrId),
    PushVariablePointer(StrId),
    DefineTemp(StrId),
    SetVariable(StrId),

    // Control flow
    Divert(Address),
    DivertIf(Address),
    DivertToVariable(StrId),
    Tunnel(Address),
    TunnelReturn,
    Call(Address),
    FunctionReturn,
    Thread(Address),
    CallExternal {
        name: StrId,
        arity: u8,
        /// Story function to run when the host has not bound `name`.
        fallback: Option<Address>,
    },
    Done,
    End,

    // Bookkeeping
    /// First instruction of a container; records a visit.
    StartContainer(ContainerId),
    /// Zero-based index of the current visit to the enclosing container.
    VisitCount,
    ReadCount(ContainerId),
    Turn,
    /// Pops element count and sequence index; pushes a shuffled index.
    Shuffle,
    SeedRandom,
    Choice { target: Address, flags: ChoiceFlags },
    ChoiceCount,
}
