/// Serializable interpreter state of one runner.
///
/// Everything a runner needs to continue, except the story, the globals it
/// is bound to and host bindings, lives here, so a snapshot is just this
/// struct plus the globals' `GlobalState`.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::core::output::Output;
use crate::schema::instruction::Address;
use crate::schema::value::{Value, ValueKind};

/// Structural faults. A runner that hits one stops for good and reports the
/// same fault from every later `advance`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum Fault {
    #[error("instruction address {0} is outside the story")]
    AddressOutOfRange(u32),
    #[error("evaluation stack underflow at {0}")]
    StackUnderflow(u32),
    #[error("cannot apply {op} to {lhs} and {rhs}")]
    InvalidOperands {
        op: String,
        lhs: ValueKind,
        rhs: ValueKind,
    },
    #[error("cannot apply {op} to {operand}")]
    InvalidOperand { op: String, operand: ValueKind },
    #[error("division by zero")]
    DivideByZero,
    #[error("RANDOM called with minimum {min} above maximum {max}")]
    InvalidRandomRange { min: i32, max: i32 },
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("dangling variable reference: {0}")]
    DanglingReference(String),
    #[error("a {0} is not a divert target")]
    NotADivertTarget(ValueKind),
    #[error("divert at {0} leads back to itself")]
    NoProgress(u32),
    #[error("tunnel return without a tunnel frame")]
    UnbalancedTunnelReturn,
    #[error("function return outside a function")]
    UnbalancedFunctionReturn,
    #[error("unbalanced string or tag capture at {0}")]
    UnbalancedCapture(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// The bottom frame.
    Normal,
    Function,
    Tunnel,
    /// Forked by `<-`; returns to the fork point on `done`.
    Thread,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub return_to: Option<Address>,
    /// Temporaries, including function parameters.
    pub locals: BTreeMap<String, Value>,
}

impl Frame {
    pub fn root() -> Self {
        Self {
            kind: FrameKind::Normal,
            return_to: None,
            locals: BTreeMap::new(),
        }
    }

    pub fn call(kind: FrameKind, return_to: Address) -> Self {
        Self {
            kind,
            return_to: Some(return_to),
            locals: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Running,
    AwaitingChoice,
    Done,
    Error,
}

/// A choice that passed its condition, with the call stack to resume on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChoice {
    /// Position among all choices declared at this point, eligible or not.
    pub index: usize,
    pub text: String,
    pub tags: Vec<String>,
    pub target: Address,
    pub frames: Vec<Frame>,
    pub invisible_default: bool,
}

/// Random state as a seed plus the number of draws taken, so it snapshots
/// as two integers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: u64,
    pub draws: u64,
}

impl RngState {
    pub fn new(seed: u64) -> Self {
        Self { seed, draws: 0 }
    }

    fn next_rng(&mut self) -> StdRng {
        let rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.draws));
        self.draws = self.draws.wrapping_add(1);
        rng
    }

    /// Inclusive range.
    pub fn range(&mut self, min: i32, max: i32) -> i32 {
        self.next_rng().gen_range(min..=max)
    }

    /// Index below `len`, which must be non-zero.
    pub fn index(&mut self, len: usize) -> usize {
        self.next_rng().gen_range(0..len)
    }
}

/// Where the current choice block started, for re-deriving its choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceOrigin {
    pub thread: ThreadState,
    pub visits: Vec<u32>,
    pub turn_marks: Vec<Option<u32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadState {
    pub ip: Address,
    /// Never empty; the first frame is the root.
    pub frames: Vec<Frame>,
    pub eval: Vec<Value>,
    pub output: Output,
    pub choices: Vec<PendingChoice>,
    /// Choices declared since the block started, eligible or not.
    pub declared_choices: usize,
    /// Tags produced while choice text was being composed.
    pub choice_tags: Vec<String>,
    pub rng: RngState,
    pub status: Status,
    pub fault: Option<Fault>,
    pub origin: Option<Box<ChoiceOrigin>>,
}

impl ThreadState {
    pub fn new(entry: Address, seed: u64) -> Self {
        Self {
            ip: entry,
            frames: vec![Frame::root()],
            eval: Vec::new(),
            output: Output::default(),
            choices: Vec::new(),
            declared_choices: 0,
            choice_tags: Vec::new(),
            rng: RngState::new(seed),
            status: Status::Running,
            fault: None,
            origin: None,
        }
    }

    pub fn frame(&self) -> &Frame {
        // `frames` always holds the root.
        &self.frames[self.frames.len() - 1]
    }

    pub fn frame_mut(&mut self) -> &mut Frame {
        let top = self.frames.len() - 1;
        &mut self.frames[top]
    }

    /// Jump somewhere new, dropping the call stack and any pending output.
    pub fn reset_to(&mut self, ip: Address) {
        self.ip = ip;
        self.frames = vec![Frame::root()];
        self.eval.clear();
        self.output.clear();
        self.choices.clear();
        self.declared_choices = 0;
        self.choice_tags.clear();
        self.status = Status::Running;
        self.origin = None;
    }
}
