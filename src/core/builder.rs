/// Programmatic emitter for compiled stories.
///
/// Containers are opened and closed in order; divert targets are given as
/// paths and resolved when the story is finished, first relative to the
/// scope they were written in and then as absolute paths.
use rustc_hash::FxHashMap;

use crate::core::story::{Story, StoryError};
use crate::schema::instruction::{
    Address, BinaryOp, ChoiceFlags, ContainerId, Instruction, StrId, UnaryOp,
};
use crate::schema::list::{FlagDecl, ListOrigin, ListTable};
use crate::schema::story_data::{ContainerInfo, ContainerKind, GlobalDecl, StoryData};
use crate::schema::value::Value;

/// How a choice is presented and what it does when taken.
#[derive(Debug, Clone, Default)]
pub struct ChoiceSpec {
    /// Text shown in the menu and repeated in the output once chosen.
    pub start: String,
    /// Text shown in the menu only.
    pub choice_only: String,
    pub once_only: bool,
    pub invisible_default: bool,
    /// Write `start` as a line at the top of the choice body.
    pub echo: bool,
    pub tags: Vec<String>,
}

impl ChoiceSpec {
    pub fn new(start: &str) -> Self {
        Self {
            start: start.to_string(),
            once_only: true,
            echo: true,
            ..Self::default()
        }
    }

    pub fn sticky(mut self) -> Self {
        self.once_only = false;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }
}

struct OpenContainer {
    index: usize,
    kind: ContainerKind,
    choice_count: usize,
    anon_count: usize,
}

struct Fixup {
    at: usize,
    scope: String,
    path: String,
}

pub struct StoryBuilder {
    instructions: Vec<Instruction>,
    strings: Vec<String>,
    string_ids: FxHashMap<String, StrId>,
    containers: Vec<ContainerInfo>,
    open: Vec<OpenContainer>,
    fixups: Vec<Fixup>,
    lists: ListTable,
    globals: Vec<GlobalDecl>,
    global_tags: Vec<String>,
    entry: Option<String>,
    /// Where flow lands after the last choice body, so a terminator written
    /// right before it is still needed.
    landing: Option<Address>,
    error: Option<StoryError>,
}

impl Default for StoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoryBuilder {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            strings: Vec::new(),
            string_ids: FxHashMap::default(),
            containers: Vec::new(),
            open: Vec::new(),
            fixups: Vec::new(),
            lists: ListTable::default(),
            globals: Vec::new(),
            global_tags: Vec::new(),
            entry: None,
            landing: None,
            error: None,
        }
    }

    fn here(&self) -> Address {
        Address(self.instructions.len() as u32)
    }

    fn scope(&self) -> String {
        self.open
            .last()
            .map(|o| self.containers[o.index].path.clone())
            .unwrap_or_default()
    }

    fn intern(&mut self, s: &str) -> StrId {
        if let Some(id) = self.string_ids.get(s) {
            return *id;
        }
        let id = StrId(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    fn fail(&mut self, err: StoryError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Append a raw instruction.
    pub fn emit(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    fn emit_to(&mut self, instruction: Instruction, path: &str) -> &mut Self {
        let at = self.instructions.len();
        let scope = self.scope();
        self.fixups.push(Fixup {
            at,
            scope,
            path: path.to_string(),
        });
        self.emit(instruction)
    }

    // ---- declarations ----

    /// Declare a list origin whose flags take the values 1, 2, 3...
    pub fn list_origin(&mut self, name: &str, flags: &[&str]) -> &mut Self {
        let pairs: Vec<(&str, i32)> = flags
            .iter()
            .enumerate()
            .map(|(i, f)| (*f, i as i32 + 1))
            .collect();
        self.list_origin_with_values(name, &pairs)
    }

    pub fn list_origin_with_values(&mut self, name: &str, flags: &[(&str, i32)]) -> &mut Self {
        if self.lists.origin_index(name).is_some() {
            self.fail(StoryError::Duplicate(name.to_string()));
            return self;
        }
        self.lists.origins.push(ListOrigin {
            name: name.to_string(),
            flags: flags
                .iter()
                .map(|(n, v)| FlagDecl {
                    name: n.to_string(),
                    value: *v,
                })
                .collect(),
        });
        self
    }

    pub fn global(&mut self, name: &str, default: impl Into<Value>) -> &mut Self {
        self.globals.push(GlobalDecl {
            name: name.to_string(),
            default: default.into(),
        });
        self
    }

    /// Declare a list global from flag names (bare or `origin.flag`).
    pub fn global_list(&mut self, name: &str, origin: &str, flags: &[&str]) -> &mut Self {
        let Some(origin_index) = self.lists.origin_index(origin) else {
            self.fail(StoryError::UnresolvedPath(origin.to_string()));
            return self;
        };
        let mut list = crate::schema::list::ListValue::empty_of(origin_index);
        match self.lists.list_of(flags) {
            Ok(flags) => list = list.union(&flags),
            Err(e) => self.fail(e.into()),
        }
        self.global(name, Value::List(list))
    }

    pub fn global_tag(&mut self, tag: &str) -> &mut Self {
        self.global_tags.push(tag.to_string());
        self
    }

    /// Tag the innermost open container (knot tags).
    pub fn knot_tag(&mut self, tag: &str) -> &mut Self {
        match self.open.last() {
            Some(o) => self.containers[o.index].tags.push(tag.to_string()),
            None => self.fail(StoryError::Builder("knot_tag outside a container".to_string())),
        }
        self
    }

    /// Start execution at `path` instead of the first container.
    pub fn entry(&mut self, path: &str) -> &mut Self {
        self.entry = Some(path.to_string());
        self
    }

    // ---- containers ----

    fn begin(&mut self, path: String, kind: ContainerKind) -> &mut Self {
        let index = self.containers.len();
        let start = self.here();
        self.containers.push(ContainerInfo {
            path,
            kind,
            start,
            end: start,
            count_visits: true,
            count_turns: true,
            tags: Vec::new(),
        });
        self.open.push(OpenContainer {
            index,
            kind,
            choice_count: 0,
            anon_count: 0,
        });
        self.emit(Instruction::StartContainer(ContainerId(index as u32)))
    }

    fn close_all(&mut self) {
        while !self.open.is_empty() {
            self.end_container();
        }
    }

    fn child_path(&self, name: &str) -> String {
        match self.scope().as_str() {
            "" => name.to_string(),
            scope => format!("{scope}.{name}"),
        }
    }

    pub fn begin_knot(&mut self, name: &str) -> &mut Self {
        self.close_all();
        self.begin(name.to_string(), ContainerKind::Knot)
    }

    pub fn begin_function(&mut self, name: &str) -> &mut Self {
        self.close_all();
        self.begin(name.to_string(), ContainerKind::Function)
    }

    /// Open a stitch inside the current knot. The knot's own content before
    /// its first stitch ends there.
    pub fn begin_stitch(&mut self, name: &str) -> &mut Self {
        while self
            .open
            .last()
            .is_some_and(|o| o.kind != ContainerKind::Knot)
        {
            self.end_container();
        }
        if self.open.is_empty() {
            return self.begin(name.to_string(), ContainerKind::Stitch);
        }
        self.terminate_with(Instruction::Done);
        let path = self.child_path(name);
        self.begin(path, ContainerKind::Stitch)
    }

    /// Open a named gather inside the current container. Flow falls into it.
    pub fn begin_gather(&mut self, name: &str) -> &mut Self {
        let path = self.child_path(name);
        self.begin(path, ContainerKind::Gather)
    }

    /// Open an anonymous nested container, useful for counting visits to a
    /// block of content.
    pub fn begin_container(&mut self) -> &mut Self {
        let n = match self.open.last_mut() {
            Some(o) => {
                o.anon_count += 1;
                o.anon_count - 1
            }
            None => self.containers.len(),
        };
        let path = self.child_path(&format!("a-{n}"));
        self.begin(path, ContainerKind::Anonymous)
    }

    fn terminate_with(&mut self, terminator: Instruction) {
        let landed = self.landing == Some(self.here());
        let ended = !landed
            && matches!(
                self.instructions.last(),
                Some(
                    Instruction::Done
                        | Instruction::End
                        | Instruction::Divert(_)
                        | Instruction::FunctionReturn
                        | Instruction::TunnelReturn
                )
            );
        if !ended {
            if terminator == Instruction::FunctionReturn {
                self.emit(Instruction::Void);
            }
            self.emit(terminator);
        }
    }

    /// Close the innermost open container. Knots, stitches and choice bodies
    /// that run off their end finish the flow; functions return nothing.
    pub fn end_container(&mut self) -> &mut Self {
        let Some(open) = self.open.pop() else {
            self.fail(StoryError::Builder("end_container without an open container".to_string()));
            return self;
        };
        match open.kind {
            ContainerKind::Knot | ContainerKind::Stitch | ContainerKind::Choice => {
                self.terminate_with(Instruction::Done)
            }
            ContainerKind::Function => self.terminate_with(Instruction::FunctionReturn),
            ContainerKind::Gather | ContainerKind::Anonymous => {}
        }
        self.containers[open.index].end = self.here();
        self
    }

    // ---- content ----

    pub fn text(&mut self, text: &str) -> &mut Self {
        let id = self.intern(text);
        self.emit(Instruction::Text(id))
    }

    pub fn newline(&mut self) -> &mut Self {
        self.emit(Instruction::Newline)
    }

    /// Text followed by a newline.
    pub fn line(&mut self, text: &str) -> &mut Self {
        self.text(text).newline()
    }

    pub fn glue(&mut self) -> &mut Self {
        self.emit(Instruction::Glue)
    }

    pub fn tag(&mut self, tag: &str) -> &mut Self {
        let id = self.intern(tag);
        self.emit(Instruction::Tag(id))
    }

    pub fn begin_tag(&mut self) -> &mut Self {
        self.emit(Instruction::BeginTag)
    }

    pub fn end_tag(&mut self) -> &mut Self {
        self.emit(Instruction::EndTag)
    }

    pub fn begin_string(&mut self) -> &mut Self {
        self.emit(Instruction::BeginString)
    }

    pub fn end_string(&mut self) -> &mut Self {
        self.emit(Instruction::EndString)
    }

    /// Pop the top of the evaluation stack into the output.
    pub fn output(&mut self) -> &mut Self {
        self.emit(Instruction::Output)
    }

    // ---- expressions ----

    pub fn push_int(&mut self, v: i32) -> &mut Self {
        self.emit(Instruction::PushInt(v))
    }

    pub fn push_float(&mut self, v: f32) -> &mut Self {
        self.emit(Instruction::PushFloat(v))
    }

    pub fn push_bool(&mut self, v: bool) -> &mut Self {
        self.emit(Instruction::PushBool(v))
    }

    pub fn push_str(&mut self, v: &str) -> &mut Self {
        let id = self.intern(v);
        self.emit(Instruction::PushString(id))
    }

    /// Push a list literal. Names may be bare or `origin.flag`.
    pub fn push_list(&mut self, flags: &[&str]) -> &mut Self {
        match self.lists.list_of(flags) {
            Ok(list) => self.emit(Instruction::PushList(list)),
            Err(e) => {
                self.fail(e.into());
                self
            }
        }
    }

    pub fn push_var(&mut self, name: &str) -> &mut Self {
        let id = self.intern(name);
        self.emit(Instruction::PushVariable(id))
    }

    /// Push a reference to a variable, for `ref` parameters.
    pub fn push_ref(&mut self, name: &str) -> &mut Self {
        let id = self.intern(name);
        self.emit(Instruction::PushVariablePointer(id))
    }

    pub fn push_divert(&mut self, path: &str) -> &mut Self {
        self.emit_to(Instruction::PushDivert(Address(u32::MAX)), path)
    }

    pub fn void(&mut self) -> &mut Self {
        self.emit(Instruction::Void)
    }

    pub fn pop(&mut self) -> &mut Self {
        self.emit(Instruction::Pop)
    }

    pub fn dup(&mut self) -> &mut Self {
        self.emit(Instruction::Duplicate)
    }

    pub fn binary(&mut self, op: BinaryOp) -> &mut Self {
        self.emit(Instruction::Binary(op))
    }

    pub fn unary(&mut self, op: UnaryOp) -> &mut Self {
        self.emit(Instruction::Unary(op))
    }

    pub fn list_range(&mut self) -> &mut Self {
        self.emit(Instruction::ListRange)
    }

    /// Pop into a variable: a temporary of the current frame if one exists,
    /// otherwise a global.
    pub fn set(&mut self, name: &str) -> &mut Self {
        let id = self.intern(name);
        self.emit(Instruction::SetVariable(id))
    }

    /// Pop into a new temporary of the current frame.
    pub fn temp(&mut self, name: &str) -> &mut Self {
        let id = self.intern(name);
        self.emit(Instruction::DefineTemp(id))
    }

    /// Push the zero-based index of this visit to the current container, the
    /// usual input to a sequence or shuffle.
    pub fn visit_count(&mut self) -> &mut Self {
        self.emit(Instruction::VisitCount)
    }

    /// Push how many times the container at `path` has been visited.
    pub fn read_count(&mut self, path: &str) -> &mut Self {
        let at = self.instructions.len();
        let scope = self.scope();
        self.fixups.push(Fixup {
            at,
            scope,
            path: path.to_string(),
        });
        self.emit(Instruction::ReadCount(ContainerId(u32::MAX)))
    }

    /// Push turns since `path` was last entered (-1 if never).
    pub fn turns_since(&mut self, path: &str) -> &mut Self {
        self.push_divert(path).unary(UnaryOp::TurnsSince)
    }

    pub fn turn(&mut self) -> &mut Self {
        self.emit(Instruction::Turn)
    }

    pub fn shuffle(&mut self) -> &mut Self {
        self.emit(Instruction::Shuffle)
    }

    pub fn seed_random(&mut self) -> &mut Self {
        self.emit(Instruction::SeedRandom)
    }

    pub fn choice_count(&mut self) -> &mut Self {
        self.emit(Instruction::ChoiceCount)
    }

    // ---- control flow ----

    pub fn divert(&mut self, path: &str) -> &mut Self {
        self.emit_to(Instruction::Divert(Address(u32::MAX)), path)
    }

    /// Pop a condition and divert when it holds.
    pub fn divert_if(&mut self, path: &str) -> &mut Self {
        self.emit_to(Instruction::DivertIf(Address(u32::MAX)), path)
    }

    pub fn divert_to_var(&mut self, name: &str) -> &mut Self {
        let id = self.intern(name);
        self.emit(Instruction::DivertToVariable(id))
    }

    pub fn tunnel(&mut self, path: &str) -> &mut Self {
        self.emit_to(Instruction::Tunnel(Address(u32::MAX)), path)
    }

    pub fn tunnel_return(&mut self) -> &mut Self {
        self.emit(Instruction::TunnelReturn)
    }

    pub fn call(&mut self, path: &str) -> &mut Self {
        self.emit_to(Instruction::Call(Address(u32::MAX)), path)
    }

    /// Return nothing from a function.
    pub fn ret(&mut self) -> &mut Self {
        self.emit(Instruction::Void).emit(Instruction::FunctionReturn)
    }

    /// Return the value on top of the evaluation stack.
    pub fn ret_value(&mut self) -> &mut Self {
        self.emit(Instruction::FunctionReturn)
    }

    pub fn thread(&mut self, path: &str) -> &mut Self {
        self.emit_to(Instruction::Thread(Address(u32::MAX)), path)
    }

    pub fn call_external(&mut self, name: &str, arity: u8) -> &mut Self {
        let name = self.intern(name);
        self.emit(Instruction::CallExternal {
            name,
            arity,
            fallback: None,
        })
    }

    /// External call that runs the story function at `fallback` when the
    /// host has not bound `name`.
    pub fn call_external_or(&mut self, name: &str, arity: u8, fallback: &str) -> &mut Self {
        let name = self.intern(name);
        self.emit_to(
            Instruction::CallExternal {
                name,
                arity,
                fallback: Some(Address(u32::MAX)),
            },
            fallback,
        )
    }

    pub fn done(&mut self) -> &mut Self {
        self.emit(Instruction::Done)
    }

    pub fn end(&mut self) -> &mut Self {
        self.emit(Instruction::End)
    }

    // ---- choices ----

    /// `* text`: once-only, echoed when chosen.
    pub fn choice(&mut self, text: &str, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.choice_with(ChoiceSpec::new(text), None, body)
    }

    /// `+ text`: offered every time.
    pub fn sticky_choice(&mut self, text: &str, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.choice_with(ChoiceSpec::new(text).sticky(), None, body)
    }

    /// `* [text]`: menu text only, nothing echoed.
    pub fn silent_choice(&mut self, text: &str, body: impl FnOnce(&mut Self)) -> &mut Self {
        let spec = ChoiceSpec {
            choice_only: text.to_string(),
            once_only: true,
            ..ChoiceSpec::default()
        };
        self.choice_with(spec, None, body)
    }

    /// `* {condition} text`. The condition closure must push one value.
    pub fn conditional_choice(
        &mut self,
        text: &str,
        condition: impl FnOnce(&mut Self),
        body: impl FnOnce(&mut Self),
    ) -> &mut Self {
        self.choice_with(ChoiceSpec::new(text), Some(Box::new(condition)), body)
    }

    /// `+ ->`: taken automatically when nothing else can be offered.
    pub fn default_choice(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
        let spec = ChoiceSpec {
            invisible_default: true,
            ..ChoiceSpec::default()
        };
        self.choice_with(spec, None, body)
    }

    pub fn choice_with<'f>(
        &mut self,
        spec: ChoiceSpec,
        condition: Option<Box<dyn FnOnce(&mut Self) + 'f>>,
        body: impl FnOnce(&mut Self),
    ) -> &mut Self {
        let has_start = !spec.start.is_empty();
        let has_choice_only = !spec.choice_only.is_empty() || (!has_start && !spec.tags.is_empty());

        if has_choice_only {
            self.begin_string().text(&spec.choice_only);
            if !has_start {
                for tag in &spec.tags {
                    self.tag(tag);
                }
            }
            self.end_string();
        }
        if has_start {
            self.begin_string().text(&spec.start);
            for tag in &spec.tags {
                self.tag(tag);
            }
            self.end_string();
        }
        let has_condition = condition.is_some();
        if let Some(condition) = condition {
            condition(self);
        }

        let choice_at = self.instructions.len();
        self.emit(Instruction::Choice {
            target: Address(u32::MAX),
            flags: ChoiceFlags {
                has_condition,
                has_start_content: has_start,
                has_choice_only_content: has_choice_only,
                invisible_default: spec.invisible_default,
                once_only: spec.once_only,
            },
        });
        let skip_at = self.instructions.len();
        self.emit(Instruction::Divert(Address(u32::MAX)));

        let n = match self.open.last_mut() {
            Some(o) => {
                o.choice_count += 1;
                o.choice_count - 1
            }
            None => self.containers.len(),
        };
        let body_start = self.here();
        let path = self.child_path(&format!("c-{n}"));
        self.begin(path, ContainerKind::Choice);
        if spec.echo && has_start {
            self.line(&spec.start);
        }
        body(self);
        self.end_container();

        let after = self.here();
        if let Instruction::Choice { target, .. } = &mut self.instructions[choice_at] {
            *target = body_start;
        }
        self.instructions[skip_at] = Instruction::Divert(after);
        self.landing = Some(after);
        self
    }

    // ---- finishing ----

    fn resolve(&self, scope: &str, path: &str) -> Option<ContainerId> {
        let lookup = |p: &str| {
            self.containers
                .iter()
                .position(|c| c.path == p)
                .map(|i| ContainerId(i as u32))
        };
        let mut scope = scope;
        loop {
            if scope.is_empty() {
                return lookup(path);
            }
            if let Some(id) = lookup(&format!("{scope}.{path}")) {
                return Some(id);
            }
            scope = scope.rsplit_once('.').map(|(head, _)| head).unwrap_or("");
        }
    }

    /// Resolve every path and produce the plain story data.
    pub fn build_data(mut self) -> Result<StoryData, StoryError> {
        self.close_all();
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        if self.instructions.is_empty() {
            self.emit(Instruction::Done);
        }

        for fixup in std::mem::take(&mut self.fixups) {
            let id = self
                .resolve(&fixup.scope, &fixup.path)
                .ok_or_else(|| StoryError::UnresolvedPath(fixup.path.clone()))?;
            let start = self.containers[id.0 as usize].start;
            match &mut self.instructions[fixup.at] {
                Instruction::Divert(a)
                | Instruction::DivertIf(a)
                | Instruction::Tunnel(a)
                | Instruction::Call(a)
                | Instruction::Thread(a)
                | Instruction::PushDivert(a) => *a = start,
                Instruction::CallExternal { fallback, .. } => *fallback = Some(start),
                Instruction::ReadCount(c) => *c = id,
                other => {
                    return Err(StoryError::Builder(format!(
                        "instruction {other:?} does not take a path"
                    )))
                }
            }
        }

        let entry = match &self.entry {
            Some(path) => {
                let id = self
                    .resolve("", path)
                    .ok_or_else(|| StoryError::UnresolvedPath(path.clone()))?;
                self.containers[id.0 as usize].start
            }
            None => Address(0),
        };

        Ok(StoryData {
            instructions: self.instructions,
            strings: self.strings,
            containers: self.containers,
            lists: self.lists,
            globals: self.globals,
            global_tags: self.global_tags,
            entry,
        })
    }

    /// Finish and load the story.
    pub fn finish(self) -> Result<Story, StoryError> {
        Story::from_data(self.build_data()?)
    }
}
