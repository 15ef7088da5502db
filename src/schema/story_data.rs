/// Plain data of a compiled story, as stored in the binary and RON forms.
use serde::{Deserialize, Serialize};

use super::instruction::{Address, Instruction};
use super::list::ListTable;
use super::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    Knot,
    Stitch,
    Gather,
    Choice,
    Function,
    Anonymous,
}

/// A named region `[start, end)` of the instruction vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Dot separated, e.g. `harbour.night`.
    pub path: String,
    pub kind: ContainerKind,
    pub start: Address,
    pub end: Address,
    #[serde(default = "default_true")]
    pub count_visits: bool,
    #[serde(default = "default_true")]
    pub count_turns: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ContainerInfo {
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// A global variable and the value it starts with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalDecl {
    pub name: String,
    pub default: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryData {
    pub instructions: Vec<Instruction>,
    pub strings: Vec<String>,
    pub containers: Vec<ContainerInfo>,
    #[serde(default)]
    pub lists: ListTable,
    #[serde(default)]
    pub globals: Vec<GlobalDecl>,
    #[serde(default)]
    pub global_tags: Vec<String>,
    pub entry: Address,
}
