/// Snapshots of a globals store and the runners bound to it.
///
/// Layout: the magic `NRTS`, a little-endian `u32` format version, then the
/// bincode-encoded `SnapshotData`. The story itself is not included; a
/// snapshot carries the story fingerprint and is rejected by any other
/// story. Host bindings and observers are not captured.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::core::globals::{GlobalState, Globals};
use crate::core::runner::Runner;
use crate::core::state::{Frame, ThreadState};
use crate::core::story::Story;

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"NRTS";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid snapshot: {0}")]
    FormatInvalid(String),
    #[error("snapshot format version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("snapshot was taken from a different story")]
    StoryMismatch,
    #[error("runner {index} is not in the snapshot ({count} runners)")]
    RunnerIndex { index: usize, count: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for SnapshotError {
    fn from(e: bincode::Error) -> Self {
        SnapshotError::FormatInvalid(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SnapshotData {
    fingerprint: u64,
    globals: GlobalState,
    runners: Vec<ThreadState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    data: SnapshotData,
}

impl Snapshot {
    /// Capture `globals` and the given runners, which must all share it.
    pub fn capture(globals: &Globals, runners: &[&Runner]) -> Result<Snapshot, SnapshotError> {
        let fingerprint = globals.story().fingerprint();
        if runners.iter().any(|r| !r.globals().ptr_eq(globals)) {
            return Err(SnapshotError::StoryMismatch);
        }
        let snapshot = Snapshot {
            data: SnapshotData {
                fingerprint,
                globals: globals.state(),
                runners: runners.iter().map(|r| r.state().clone()).collect(),
            },
        };
        tracing::debug!(runners = runners.len(), "snapshot captured");
        Ok(snapshot)
    }

    pub fn fingerprint(&self) -> u64 {
        self.data.fingerprint
    }

    pub fn runner_count(&self) -> usize {
        self.data.runners.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let payload = bincode::serialize(&self.data)?;
        let mut bytes = Vec::with_capacity(payload.len() + 8);
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decode a snapshot and check it against `story`.
    pub fn from_bytes(story: &Story, bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
        if bytes.len() < 8 || &bytes[..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::FormatInvalid("missing snapshot header".to_string()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let found = u32::from_le_bytes(version);
        if found != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                found,
                expected: SNAPSHOT_FORMAT_VERSION,
            });
        }
        let data: SnapshotData = bincode::deserialize(&bytes[8..])?;
        if data.fingerprint != story.fingerprint() {
            return Err(SnapshotError::StoryMismatch);
        }
        if !data.globals.fits(story) {
            return Err(SnapshotError::FormatInvalid(
                "globals do not match the story's declarations".to_string(),
            ));
        }
        for (index, runner) in data.runners.iter().enumerate() {
            if !thread_fits(story, runner) {
                return Err(SnapshotError::FormatInvalid(format!(
                    "runner {index} has an invalid position"
                )));
            }
        }
        Ok(Snapshot { data })
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), SnapshotError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn from_file(story: &Story, path: &Path) -> Result<Snapshot, SnapshotError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(story, &bytes)
    }

    /// Rebuild the globals and every runner. Runners come back without host
    /// bindings; bind them again before advancing.
    pub fn restore(&self, story: &Story) -> Result<(Globals, Vec<Runner>), SnapshotError> {
        let globals = self.restore_globals(story)?;
        let runners = (0..self.runner_count())
            .map(|index| self.restore_runner(story, &globals, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((globals, runners))
    }

    pub(crate) fn restore_globals(&self, story: &Story) -> Result<Globals, SnapshotError> {
        if self.data.fingerprint != story.fingerprint() {
            return Err(SnapshotError::StoryMismatch);
        }
        Ok(Globals::with_state(story.clone(), self.data.globals.clone()))
    }

    pub(crate) fn restore_runner(
        &self,
        story: &Story,
        globals: &Globals,
        index: usize,
    ) -> Result<Runner, SnapshotError> {
        if self.data.fingerprint != story.fingerprint()
            || globals.story().fingerprint() != story.fingerprint()
        {
            return Err(SnapshotError::StoryMismatch);
        }
        let state = self
            .data
            .runners
            .get(index)
            .cloned()
            .ok_or(SnapshotError::RunnerIndex {
                index,
                count: self.runner_count(),
            })?;
        Ok(Runner::from_state(story.clone(), globals.clone(), state))
    }
}

/// Whether every address a thread can resume at lies inside `story` and
/// every call stack it can switch to keeps its root frame.
fn thread_fits(story: &Story, thread: &ThreadState) -> bool {
    let len = story.len();
    let stack_fits = |frames: &[Frame]| {
        !frames.is_empty()
            && frames
                .iter()
                .all(|f| f.return_to.map_or(true, |addr| addr.index() <= len))
    };
    let origin_fits = thread.origin.as_ref().map_or(true, |origin| {
        origin.visits.len() == story.container_count()
            && origin.turn_marks.len() == story.container_count()
            && thread_fits(story, &origin.thread)
    });
    thread.ip.index() <= len
        && stack_fits(thread.frames.as_slice())
        && thread
            .choices
            .iter()
            .all(|c| c.target.index() < len && stack_fits(c.frames.as_slice()))
        && origin_fits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::StoryBuilder;
    use crate::core::runner::Step;
    use crate::core::state::FrameKind;
    use crate::schema::instruction::Address;

    fn story() -> Story {
        let mut b = StoryBuilder::new();
        b.global("gold", 3);
        b.begin_knot("start")
            .line("One.")
            .push_var("gold")
            .push_int(1)
            .binary(crate::schema::instruction::BinaryOp::Add)
            .set("gold")
            .line("Two.")
            .end();
        b.finish().unwrap()
    }

    #[test]
    fn bytes_carry_header_and_fingerprint() {
        let story = story();
        let globals = story.new_globals();
        let runner = story.new_runner(&globals).unwrap();
        let snapshot = runner.snapshot().unwrap();
        let bytes = snapshot.to_bytes().unwrap();
        assert_eq!(&bytes[..4], SNAPSHOT_MAGIC);
        let decoded = Snapshot::from_bytes(&story, &bytes).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.runner_count(), 1);
    }

    #[test]
    fn header_problems_are_reported() {
        let story = story();
        assert!(matches!(
            Snapshot::from_bytes(&story, b"NRT"),
            Err(SnapshotError::FormatInvalid(_))
        ));
        let mut bytes = story.new_globals().snapshot().unwrap().to_bytes().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            Snapshot::from_bytes(&story, &bytes),
            Err(SnapshotError::VersionMismatch { found: 9, .. })
        ));
    }

    #[test]
    fn restored_runner_continues_where_it_stopped() {
        let story = story();
        let globals = story.new_globals();
        let mut runner = story.new_runner(&globals).unwrap();
        assert!(matches!(runner.advance().unwrap(), Step::Line(l) if l.text == "One."));
        let bytes = runner.snapshot().unwrap().to_bytes().unwrap();

        let snapshot = Snapshot::from_bytes(&story, &bytes).unwrap();
        let (globals, mut runners) = snapshot.restore(&story).unwrap();
        let resumed = &mut runners[0];
        assert!(matches!(resumed.advance().unwrap(), Step::Line(l) if l.text == "Two."));
        assert_eq!(globals.get("gold").unwrap(), crate::schema::value::Value::Int(4));
        assert!(matches!(
            snapshot.restore_runner(&story, &globals, 3),
            Err(SnapshotError::RunnerIndex { index: 3, count: 1 })
        ));
    }

    fn at_choice() -> (Story, Snapshot) {
        let mut b = StoryBuilder::new();
        b.begin_knot("start").line("Pick.");
        b.choice("Go", |b| {
            b.line("Gone.").end();
        });
        let story = b.finish().unwrap();
        let globals = story.new_globals();
        let mut runner = story.new_runner(&globals).unwrap();
        while let Step::Line(_) = runner.advance().unwrap() {}
        let snapshot = runner.snapshot().unwrap();
        (story, snapshot)
    }

    fn rejected(story: &Story, snapshot: &Snapshot) -> bool {
        let bytes = snapshot.to_bytes().unwrap();
        matches!(
            Snapshot::from_bytes(story, &bytes),
            Err(SnapshotError::FormatInvalid(_))
        )
    }

    #[test]
    fn damaged_runner_state_is_rejected() {
        let (story, snapshot) = at_choice();
        assert!(!rejected(&story, &snapshot));
        assert_eq!(snapshot.data.runners[0].choices.len(), 1);

        let mut no_stack = snapshot.clone();
        no_stack.data.runners[0].choices[0].frames.clear();
        assert!(rejected(&story, &no_stack));

        let mut bad_target = snapshot.clone();
        bad_target.data.runners[0].choices[0].target = Address(story.len() as u32);
        assert!(rejected(&story, &bad_target));

        let mut bad_return = snapshot.clone();
        bad_return.data.runners[0]
            .frames
            .push(Frame::call(FrameKind::Tunnel, Address(story.len() as u32 + 5)));
        assert!(rejected(&story, &bad_return));

        let mut bad_origin = snapshot.clone();
        let origin = bad_origin.data.runners[0].origin.as_mut().unwrap();
        origin.thread.frames.clear();
        assert!(rejected(&story, &bad_origin));

        let mut short_counters = snapshot;
        let origin = short_counters.data.runners[0].origin.as_mut().unwrap();
        origin.visits.pop();
        assert!(rejected(&story, &short_counters));
    }
}
