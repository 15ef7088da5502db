/// The compiled story: an immutable, shared, validated instruction graph.
///
/// A `Story` is a cheap handle (`Arc`) to the loaded data. Globals stores
/// and runners each hold one, so the content lives as long as anything
/// created from it.
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::core::globals::Globals;
use crate::core::runner::{Runner, RunnerBuilder, RunnerError};
use crate::core::snapshot::{Snapshot, SnapshotError};
use crate::schema::instruction::{Address, ContainerId, Instruction, StrId};
use crate::schema::list::{ListError, ListFlag, ListTable};
use crate::schema::story_data::{ContainerInfo, GlobalDecl, StoryData};
use crate::schema::value::Value;

/// Leading bytes of a compiled story.
pub const STORY_MAGIC: [u8; 4] = *b"NRTB";
/// Version of the compiled story layout this build reads and writes.
pub const STORY_FORMAT_VERSION: u32 = 1;

/// First eight bytes of the SHA-256 of `bytes`, little-endian. The same on
/// every platform, so fingerprints and shuffle seeds travel with saves.
pub(crate) fn digest64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

#[derive(Debug, Error)]
pub enum StoryError {
    #[error("invalid story format: {0}")]
    FormatInvalid(String),
    #[error("story format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("list error: {0}")]
    List(#[from] ListError),
    #[error("unresolved path: {0}")]
    UnresolvedPath(String),
    #[error("duplicate declaration: {0}")]
    Duplicate(String),
    #[error("builder error: {0}")]
    Builder(String),
}

pub(crate) struct CompiledStory {
    data: StoryData,
    fingerprint: u64,
    paths: FxHashMap<String, ContainerId>,
    globals: FxHashMap<String, usize>,
    /// Innermost container owning each address.
    owners: Vec<Option<ContainerId>>,
}

#[derive(Clone)]
pub struct Story {
    inner: Arc<CompiledStory>,
}

impl std::fmt::Debug for Story {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Story")
            .field("instructions", &self.inner.data.instructions.len())
            .field("containers", &self.inner.data.containers.len())
            .field("fingerprint", &format_args!("{:016x}", self.inner.fingerprint))
            .finish()
    }
}

impl Story {
    /// Load a compiled story from its binary form.
    pub fn load(bytes: &[u8]) -> Result<Story, StoryError> {
        if bytes.len() < 8 {
            return Err(StoryError::FormatInvalid("truncated header".to_string()));
        }
        if bytes[..4] != STORY_MAGIC {
            return Err(StoryError::FormatInvalid("bad magic".to_string()));
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != STORY_FORMAT_VERSION {
            return Err(StoryError::VersionMismatch {
                found: version,
                expected: STORY_FORMAT_VERSION,
            });
        }
        let data: StoryData = bincode::deserialize(&bytes[8..])
            .map_err(|e| StoryError::FormatInvalid(e.to_string()))?;
        Self::from_data(data)
    }

    /// Load a compiled story from a file.
    pub fn load_from_file(path: &Path) -> Result<Story, StoryError> {
        let bytes = std::fs::read(path)?;
        Self::load(&bytes)
    }

    /// Load story data from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<Story, StoryError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    /// Parse story data from a RON string.
    pub fn parse_ron(input: &str) -> Result<Story, StoryError> {
        let data: StoryData = ron::from_str(input)?;
        Self::from_data(data)
    }

    /// Validate story data and wrap it.
    pub fn from_data(data: StoryData) -> Result<Story, StoryError> {
        validate(&data)?;

        let payload = bincode::serialize(&data)
            .map_err(|e| StoryError::FormatInvalid(e.to_string()))?;
        let fingerprint = digest64(&payload);

        let mut paths = FxHashMap::default();
        for (i, c) in data.containers.iter().enumerate() {
            if paths.insert(c.path.clone(), ContainerId(i as u32)).is_some() {
                return Err(StoryError::Duplicate(c.path.clone()));
            }
        }
        let mut globals = FxHashMap::default();
        for (i, g) in data.globals.iter().enumerate() {
            if globals.insert(g.name.clone(), i).is_some() {
                return Err(StoryError::Duplicate(g.name.clone()));
            }
        }

        // Fill outer containers first so inner ones overwrite them.
        let mut order: Vec<usize> = (0..data.containers.len()).collect();
        order.sort_by_key(|&i| {
            let c = &data.containers[i];
            std::cmp::Reverse(c.end.0 - c.start.0)
        });
        let mut owners = vec![None; data.instructions.len()];
        for i in order {
            let c = &data.containers[i];
            for slot in &mut owners[c.start.index()..c.end.index()] {
                *slot = Some(ContainerId(i as u32));
            }
        }

        tracing::debug!(
            instructions = data.instructions.len(),
            containers = data.containers.len(),
            globals = data.globals.len(),
            fingerprint = %format_args!("{fingerprint:016x}"),
            "story loaded"
        );

        Ok(Story {
            inner: Arc::new(CompiledStory {
                data,
                fingerprint,
                paths,
                globals,
                owners,
            }),
        })
    }

    /// Serialize to the binary form accepted by `load`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoryError> {
        let payload = bincode::serialize(&self.inner.data)
            .map_err(|e| StoryError::FormatInvalid(e.to_string()))?;
        let mut bytes = Vec::with_capacity(payload.len() + 8);
        bytes.extend_from_slice(&STORY_MAGIC);
        bytes.extend_from_slice(&STORY_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), StoryError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn data(&self) -> &StoryData {
        &self.inner.data
    }

    /// Content signature recorded in snapshots.
    pub fn fingerprint(&self) -> u64 {
        self.inner.fingerprint
    }

    pub fn ptr_eq(&self, other: &Story) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn entry(&self) -> Address {
        self.inner.data.entry
    }

    pub fn len(&self) -> usize {
        self.inner.data.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.instructions.is_empty()
    }

    pub fn instruction(&self, addr: Address) -> Option<&Instruction> {
        self.inner.data.instructions.get(addr.index())
    }

    pub fn string(&self, id: StrId) -> Option<&str> {
        self.inner.data.strings.get(id.0 as usize).map(String::as_str)
    }

    pub fn container(&self, id: ContainerId) -> Option<&ContainerInfo> {
        self.inner.data.containers.get(id.0 as usize)
    }

    pub fn container_count(&self) -> usize {
        self.inner.data.containers.len()
    }

    pub fn container_by_path(&self, path: &str) -> Option<ContainerId> {
        self.inner.paths.get(path).copied()
    }

    /// Innermost container holding `addr`.
    pub fn container_at(&self, addr: Address) -> Option<ContainerId> {
        self.inner.owners.get(addr.index()).copied().flatten()
    }

    /// Container that starts exactly at `addr`, if any.
    pub fn container_starting_at(&self, addr: Address) -> Option<ContainerId> {
        match self.instruction(addr) {
            Some(Instruction::StartContainer(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn global_tags(&self) -> &[String] {
        &self.inner.data.global_tags
    }

    /// Tags declared at the top of the knot or stitch at `path`.
    pub fn knot_tags(&self, path: &str) -> Option<&[String]> {
        let id = self.container_by_path(path)?;
        self.container(id).map(|c| c.tags.as_slice())
    }

    pub fn lists(&self) -> &ListTable {
        &self.inner.data.lists
    }

    pub fn flag_name(&self, flag: ListFlag) -> Option<&str> {
        self.inner.data.lists.flag_name(flag)
    }

    pub fn flag_by_name(&self, name: &str) -> Result<ListFlag, ListError> {
        self.inner.data.lists.flag_by_name(name)
    }

    pub fn global_decls(&self) -> &[GlobalDecl] {
        &self.inner.data.globals
    }

    pub fn global_index(&self, name: &str) -> Option<usize> {
        self.inner.globals.get(name).copied()
    }

    /// A fresh globals store holding every declared default.
    pub fn new_globals(&self) -> Globals {
        Globals::new(self.clone())
    }

    pub fn new_globals_from_snapshot(&self, snapshot: &Snapshot) -> Result<Globals, SnapshotError> {
        snapshot.restore_globals(self)
    }

    /// A runner with default settings, bound to `globals`.
    pub fn new_runner(&self, globals: &Globals) -> Result<Runner, RunnerError> {
        self.runner(globals).build()
    }

    /// Configure a runner before creating it.
    pub fn runner(&self, globals: &Globals) -> RunnerBuilder {
        RunnerBuilder::new(self.clone(), globals.clone())
    }

    /// Recreate runner `index` of a snapshot, bound to `globals`.
    pub fn new_runner_from_snapshot(
        &self,
        globals: &Globals,
        snapshot: &Snapshot,
        index: usize,
    ) -> Result<Runner, SnapshotError> {
        snapshot.restore_runner(self, globals, index)
    }
}

fn validate(data: &StoryData) -> Result<(), StoryError> {
    let len = data.instructions.len();
    if len == 0 {
        return Err(StoryError::FormatInvalid("story has no instructions".to_string()));
    }
    if data.lists.origins.len() > u16::MAX as usize {
        return Err(StoryError::FormatInvalid("too many list origins".to_string()));
    }

    let bad = |what: &str, at: usize| -> Result<(), StoryError> {
        Err(StoryError::FormatInvalid(format!("{what} at instruction {at}")))
    };
    let addr_ok = |a: &Address| a.index() < len;
    let str_ok = |s: &StrId| (s.0 as usize) < data.strings.len();
    let container_ok = |c: &ContainerId| (c.0 as usize) < data.containers.len();

    if !addr_ok(&data.entry) {
        return Err(StoryError::FormatInvalid("entry address out of range".to_string()));
    }

    for (at, ins) in data.instructions.iter().enumerate() {
        match ins {
            Instruction::Text(s)
            | Instruction::Tag(s)
            | Instruction::PushString(s)
            | Instruction::PushVariable(s)
            | Instruction::PushVariablePointer(s)
            | Instruction::DefineTemp(s)
            | Instruction::SetVariable(s)
            | Instruction::DivertToVariable(s) => {
                if !str_ok(s) {
                    return bad("string index out of range", at);
                }
            }
            Instruction::PushDivert(a)
            | Instruction::Divert(a)
            | Instruction::DivertIf(a)
            | Instruction::Tunnel(a)
            | Instruction::Call(a)
            | Instruction::Thread(a) => {
                if !addr_ok(a) {
                    return bad("address out of range", at);
                }
            }
            Instruction::Choice { target, .. } => {
                if !addr_ok(target) {
                    return bad("choice target out of range", at);
                }
            }
            Instruction::CallExternal { name, fallback, .. } => {
                if !str_ok(name) {
                    return bad("string index out of range", at);
                }
                if fallback.as_ref().is_some_and(|a| !addr_ok(a)) {
                    return bad("fallback address out of range", at);
                }
            }
            Instruction::StartContainer(c) | Instruction::ReadCount(c) => {
                if !container_ok(c) {
                    return bad("container index out of range", at);
                }
            }
            Instruction::PushList(list) => {
                data.lists.validate(list)?;
            }
            _ => {}
        }
    }

    for c in &data.containers {
        if c.start > c.end || c.end.index() > len {
            return Err(StoryError::FormatInvalid(format!(
                "container {} has an invalid range",
                c.path
            )));
        }
    }

    for g in &data.globals {
        match &g.default {
            Value::List(list) => data.lists.validate(list)?,
            Value::DivertTarget(a) if !addr_ok(a) => {
                return Err(StoryError::FormatInvalid(format!(
                    "global {} points outside the story",
                    g.name
                )));
            }
            Value::Pointer { .. } => {
                return Err(StoryError::FormatInvalid(format!(
                    "global {} cannot default to a pointer",
                    g.name
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::StoryBuilder;

    fn tiny() -> Story {
        let mut b = StoryBuilder::new();
        b.global("score", Value::Int(0));
        b.begin_knot("start");
        b.line("Hello.");
        b.end_container();
        b.finish().unwrap()
    }

    #[test]
    fn binary_round_trip_keeps_fingerprint() {
        let story = tiny();
        let bytes = story.to_bytes().unwrap();
        let loaded = Story::load(&bytes).unwrap();
        assert_eq!(loaded.fingerprint(), story.fingerprint());
        assert_eq!(loaded.data(), story.data());
    }

    #[test]
    fn fingerprint_does_not_depend_on_the_platform() {
        assert_eq!(digest64(b"tavern.c-0"), 0x52ab_6f6a_ebeb_085f);
        let story = tiny();
        let payload = bincode::serialize(story.data()).unwrap();
        assert_eq!(story.fingerprint(), digest64(&payload));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = tiny().to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            Story::load(&bytes),
            Err(StoryError::VersionMismatch { found: 7, .. })
        ));
        bytes[0] = b'X';
        assert!(matches!(Story::load(&bytes), Err(StoryError::FormatInvalid(_))));
        assert!(matches!(Story::load(&[1, 2]), Err(StoryError::FormatInvalid(_))));
    }

    #[test]
    fn rejects_out_of_range_addresses() {
        let mut data = tiny().data().clone();
        data.instructions.push(Instruction::Divert(Address(999)));
        assert!(matches!(
            Story::from_data(data),
            Err(StoryError::FormatInvalid(_))
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        let bytes = tiny().to_bytes().unwrap();
        let cut = &bytes[..bytes.len() / 2];
        assert!(matches!(Story::load(cut), Err(StoryError::FormatInvalid(_))));
    }

    #[test]
    fn container_lookup() {
        let story = tiny();
        let id = story.container_by_path("start").unwrap();
        let info = story.container(id).unwrap();
        assert_eq!(story.container_at(info.start), Some(id));
        assert_eq!(story.container_starting_at(info.start), Some(id));
        assert_eq!(story.global_index("score"), Some(0));
    }
}
