/// The runner: one execution thread over a compiled story.
///
/// `advance` runs until a line is complete, a choice point is reached or the
/// story ends. After a line break the runner keeps going on a saved copy of
/// its state so that glue further on can still join the next text onto the
/// line; anything else visible rolls it back to the save and the line is
/// returned.
use std::fmt;
use thiserror::Error;

use crate::core::callbacks::{Binding, CallbackError, Callbacks, IntoExternal};
use crate::core::globals::{GlobalState, Globals};
use crate::core::output::LineState;
use crate::core::snapshot::{Snapshot, SnapshotError};
use crate::core::state::{ChoiceOrigin, Fault, FrameKind, PendingChoice, RngState, Status, ThreadState};
use crate::core::story::Story;
use crate::schema::story_data::ContainerKind;
use crate::schema::value::{Value, ValueKind};

pub use crate::core::output::Line;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunnerError {
    #[error("the runner is not waiting for a choice")]
    NotAwaitingChoice,
    #[error("choice {0} is not available")]
    InvalidChoiceIndex(usize),
    #[error("external function '{0}' is not bound")]
    UnboundExternalFunction(String),
    #[error("tunnel return without a tunnel frame")]
    UnbalancedTunnelReturn,
    #[error("callback error: {0}")]
    Callback(#[from] CallbackError),
    #[error("unknown path: {0}")]
    UnknownPath(String),
    #[error("globals were created for a different story")]
    StoryMismatch,
    #[error("runner faulted: {0}")]
    Fault(Fault),
}

impl From<Fault> for RunnerError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::UnbalancedTunnelReturn => RunnerError::UnbalancedTunnelReturn,
            other => RunnerError::Fault(other),
        }
    }
}

impl RunnerError {
    fn as_fault(&self) -> Option<Fault> {
        match self {
            RunnerError::Fault(f) => Some(f.clone()),
            RunnerError::UnbalancedTunnelReturn => Some(Fault::UnbalancedTunnelReturn),
            _ => None,
        }
    }
}

/// A choice as offered to the host. `index` is the choice's position among
/// all choices declared at this point, so it stays stable when earlier
/// choices are hidden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub index: usize,
    pub text: String,
    pub tags: Vec<String>,
}

/// Result of one `advance`.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Line(Line),
    Choices(Vec<Choice>),
    Done,
}

/// Outcome of a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// Stop looking ahead before calling a function that is not safe to
    /// call speculatively.
    Yield,
}

struct Checkpoint {
    thread: ThreadState,
    globals: GlobalState,
}

/// Builder for a `Runner`. Created by `Story::runner`.
pub struct RunnerBuilder {
    story: Story,
    globals: Globals,
    seed: u64,
    fallback: Option<Value>,
    start: Option<String>,
    callbacks: Callbacks,
}

impl RunnerBuilder {
    pub(crate) fn new(story: Story, globals: Globals) -> Self {
        Self {
            story,
            globals,
            seed: 0,
            fallback: None,
            start: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Seed for `RANDOM`, shuffles and list picks.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Value returned by external functions the host has not bound and the
    /// story has no fallback for.
    pub fn fallback_value(mut self, value: impl Into<Value>) -> Self {
        self.fallback = Some(value.into());
        self
    }

    /// Start at a knot or stitch instead of the story entry.
    pub fn start_at(mut self, path: &str) -> Self {
        self.start = Some(path.to_string());
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn build(self) -> Result<Runner, RunnerError> {
        if self.globals.story().fingerprint() != self.story.fingerprint() {
            return Err(RunnerError::StoryMismatch);
        }
        let entry = match &self.start {
            Some(path) => {
                let id = self
                    .story
                    .container_by_path(path)
                    .ok_or_else(|| RunnerError::UnknownPath(path.clone()))?;
                self.story
                    .container(id)
                    .map(|c| c.start)
                    .ok_or_else(|| RunnerError::UnknownPath(path.clone()))?
            }
            None => self.story.entry(),
        };
        tracing::debug!(seed = self.seed, entry = entry.0, "runner created");
        Ok(Runner {
            state: ThreadState::new(entry, self.seed),
            story: self.story,
            globals: self.globals,
            callbacks: self.callbacks,
            fallback: self.fallback,
        })
    }
}

pub struct Runner {
    pub(crate) story: Story,
    pub(crate) globals: Globals,
    pub(crate) state: ThreadState,
    pub(crate) callbacks: Callbacks,
    pub(crate) fallback: Option<Value>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("story", &self.story)
            .field("ip", &self.state.ip)
            .field("status", &self.state.status)
            .field("frames", &self.state.frames.len())
            .finish()
    }
}

impl Runner {
    pub(crate) fn from_state(story: Story, globals: Globals, state: ThreadState) -> Self {
        Self {
            story,
            globals,
            state,
            callbacks: Callbacks::new(),
            fallback: None,
        }
    }

    pub(crate) fn state(&self) -> &ThreadState {
        &self.state
    }

    pub fn story(&self) -> &Story {
        &self.story
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn status(&self) -> Status {
        self.state.status
    }

    pub fn can_continue(&self) -> bool {
        self.state.status == Status::Running
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.state.fault.as_ref()
    }

    // ---- host functions ----

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    pub fn bind<Args, R, F>(&mut self, name: &str, f: F) -> &mut Binding
    where
        F: IntoExternal<Args, R>,
    {
        self.callbacks.bind(name, f)
    }

    pub fn bind_void<Args, F>(&mut self, name: &str, f: F) -> &mut Binding
    where
        F: IntoExternal<Args, ()>,
    {
        self.callbacks.bind_void(name, f)
    }

    pub fn bind_raw<F>(
        &mut self,
        name: &str,
        arity: usize,
        kinds: Vec<Option<ValueKind>>,
        f: F,
    ) -> &mut Binding
    where
        F: Fn(&[Value]) -> Value + 'static,
    {
        self.callbacks.bind_raw(name, arity, kinds, f)
    }

    pub fn set_fallback_value(&mut self, value: Option<Value>) {
        self.fallback = value;
    }

    // ---- execution ----

    /// Run until the next line, choice set or the end of the story.
    ///
    /// Lines that render empty and carry no tags are skipped. A runner that
    /// has faulted reports the same fault every time.
    pub fn advance(&mut self) -> Result<Step, RunnerError> {
        if let Some(fault) = &self.state.fault {
            return Err(fault.clone().into());
        }
        match self.state.status {
            Status::AwaitingChoice => return Ok(Step::Choices(self.choices())),
            Status::Done => return Ok(Step::Done),
            Status::Error | Status::Running => {}
        }

        let origin = self.origin_point();
        loop {
            match self.continue_line()? {
                Step::Line(line) if line.is_blank() && self.can_continue() => continue,
                step => {
                    if self.state.status == Status::AwaitingChoice && self.state.origin.is_none() {
                        self.state.origin = Some(Box::new(origin));
                    }
                    if let Step::Line(line) = &step {
                        tracing::trace!(text = %line.text, tags = line.tags.len(), "line");
                    }
                    return Ok(step);
                }
            }
        }
    }

    /// Every remaining line up to the next choice point or the end,
    /// joined with newlines.
    pub fn read_all(&mut self) -> Result<String, RunnerError> {
        let mut lines = Vec::new();
        while let Step::Line(line) = self.advance()? {
            lines.push(line.text);
        }
        Ok(lines.join("\n"))
    }

    fn origin_point(&self) -> ChoiceOrigin {
        let mut thread = self.state.clone();
        thread.origin = None;
        let globals = self.globals.state();
        ChoiceOrigin {
            thread,
            visits: globals.visits,
            turn_marks: globals.turn_marks,
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            thread: self.state.clone(),
            globals: self.globals.state(),
        }
    }

    fn rollback(&mut self, saved: Checkpoint) {
        self.state = saved.thread;
        self.globals.restore_state(saved.globals);
        self.globals.discard_deferred();
    }

    fn fail(&mut self, err: RunnerError) -> RunnerError {
        if let Some(fault) = err.as_fault() {
            tracing::warn!(ip = self.state.ip.0, %fault, "runner faulted");
            self.state.status = Status::Error;
            self.state.fault = Some(fault);
        }
        err
    }

    fn continue_line(&mut self) -> Result<Step, RunnerError> {
        let mut lookahead: Option<Checkpoint> = None;

        while self.state.status == Status::Running {
            let flow = match self.step(lookahead.is_some()) {
                Ok(flow) => flow,
                Err(err) => {
                    // The line before the failure is complete; report the
                    // failure when execution gets back to it.
                    if let Some(saved) = lookahead.take() {
                        self.rollback(saved);
                        break;
                    }
                    return Err(self.fail(err));
                }
            };
            if flow == Flow::Yield {
                if let Some(saved) = lookahead.take() {
                    self.rollback(saved);
                }
                break;
            }
            if self.state.output.is_capturing() {
                continue;
            }
            match (self.state.output.line_state(), lookahead.is_some()) {
                (LineState::Overflow, true) => {
                    if let Some(saved) = lookahead.take() {
                        self.rollback(saved);
                    }
                    break;
                }
                (LineState::Overflow, false) => break,
                (LineState::Complete, false) => {
                    lookahead = Some(self.checkpoint());
                    self.globals.begin_deferral();
                }
                (LineState::Empty | LineState::Partial, true) => {
                    lookahead = None;
                    self.globals.flush_deferred();
                }
                _ => {}
            }
        }

        if let Some(saved) = lookahead.take() {
            self.rollback(saved);
        }

        let line = self.state.output.take_line();
        if !line.is_blank() || self.state.status == Status::Running {
            return Ok(Step::Line(line));
        }
        Ok(match self.state.status {
            Status::AwaitingChoice => Step::Choices(self.choices()),
            _ => Step::Done,
        })
    }

    // ---- choices ----

    /// Choices on offer, in declaration order. Empty unless the runner is
    /// waiting for a choice.
    pub fn choices(&self) -> Vec<Choice> {
        if self.state.status != Status::AwaitingChoice {
            return Vec::new();
        }
        self.state
            .choices
            .iter()
            .filter(|c| !c.invisible_default)
            .map(|c| Choice {
                index: c.index,
                text: c.text.clone(),
                tags: c.tags.clone(),
            })
            .collect()
    }

    /// Take the choice with declaration index `index`.
    pub fn choose(&mut self, index: usize) -> Result<(), RunnerError> {
        if self.state.status != Status::AwaitingChoice {
            return Err(RunnerError::NotAwaitingChoice);
        }
        let choice = self
            .state
            .choices
            .iter()
            .find(|c| c.index == index && !c.invisible_default)
            .cloned()
            .ok_or(RunnerError::InvalidChoiceIndex(index))?;
        self.take_choice(choice);
        Ok(())
    }

    pub(crate) fn take_choice(&mut self, choice: PendingChoice) {
        tracing::debug!(index = choice.index, text = %choice.text, "choice taken");
        let mut frames = choice.frames;
        for frame in &mut frames {
            if frame.kind == FrameKind::Thread {
                frame.kind = FrameKind::Normal;
            }
        }
        let state = &mut self.state;
        state.frames = frames;
        state.ip = choice.target;
        state.eval.clear();
        state.choices.clear();
        state.declared_choices = 0;
        state.choice_tags.clear();
        state.status = Status::Running;
        state.origin = None;
        self.globals.next_turn();
    }

    /// Run the current choice point again from where it started, so that
    /// conditions see variables changed since. Visit counters go back to
    /// where they were; variables keep their new values.
    pub fn reevaluate_choices(&mut self) -> Result<Step, RunnerError> {
        if self.state.status != Status::AwaitingChoice {
            return Err(RunnerError::NotAwaitingChoice);
        }
        let Some(origin) = self.state.origin.take() else {
            return Ok(Step::Choices(self.choices()));
        };
        let origin = *origin;
        self.state = origin.thread;
        self.globals.restore_counters(origin.visits, origin.turn_marks);
        self.advance()
    }

    // ---- navigation ----

    /// Jump to a knot or stitch, dropping the call stack, pending output
    /// and choices.
    pub fn move_to(&mut self, path: &str) -> Result<(), RunnerError> {
        if let Some(fault) = &self.state.fault {
            return Err(fault.clone().into());
        }
        let start = self
            .story
            .container_by_path(path)
            .and_then(|id| self.story.container(id))
            .map(|c| c.start)
            .ok_or_else(|| RunnerError::UnknownPath(path.to_string()))?;
        tracing::debug!(path, "runner moved");
        self.state.reset_to(start);
        Ok(())
    }

    pub fn set_rng_seed(&mut self, seed: u64) {
        self.state.rng = RngState::new(seed);
    }

    /// Path of the innermost container at the current position.
    pub fn current_container_path(&self) -> Option<&str> {
        let id = self.story.container_at(self.state.ip)?;
        self.story.container(id).map(|c| c.path.as_str())
    }

    pub fn global_tags(&self) -> &[String] {
        self.story.global_tags()
    }

    pub fn knot_tags(&self, path: &str) -> Option<&[String]> {
        self.story.knot_tags(path)
    }

    /// Tags of the knot (or stitch) the runner is in.
    pub fn current_knot_tags(&self) -> &[String] {
        let mut id = self.story.container_at(self.state.ip);
        while let Some(current) = id {
            let Some(info) = self.story.container(current) else {
                break;
            };
            if matches!(info.kind, ContainerKind::Knot | ContainerKind::Stitch) {
                return &info.tags;
            }
            id = info
                .path
                .rsplit_once('.')
                .and_then(|(parent, _)| self.story.container_by_path(parent));
        }
        &[]
    }

    /// Capture this runner together with its globals.
    pub fn snapshot(&self) -> Result<Snapshot, SnapshotError> {
        Snapshot::capture(&self.globals, &[self])
    }
}
