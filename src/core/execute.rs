/// Instruction dispatch for `Runner`.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::operators;
use crate::core::output::CaptureKind;
use crate::core::runner::{Flow, Runner, RunnerError};
use crate::core::story::digest64;
use crate::core::state::{Fault, Frame, FrameKind, PendingChoice, RngState, Status};
use crate::schema::instruction::{Address, ChoiceFlags, ContainerId, Instruction, StrId, UnaryOp};
use crate::schema::value::Value;

impl Runner {
    /// Execute the instruction at `ip`. With `looking_ahead` set, an
    /// external function that is not lookahead-safe is left unexecuted and
    /// `Flow::Yield` is returned instead.
    pub(crate) fn step(&mut self, looking_ahead: bool) -> Result<Flow, RunnerError> {
        let story = self.story.clone();
        let ip = self.state.ip;
        let Some(instruction) = story.instruction(ip) else {
            if ip.index() == story.len() {
                self.end_of_flow();
                return Ok(Flow::Continue);
            }
            return Err(Fault::AddressOutOfRange(ip.0).into());
        };
        let mut next = ip.next();

        match instruction {
            Instruction::Text(id) => {
                let text = self.string(*id)?;
                self.state.output.text(&text);
            }
            Instruction::Newline => self.state.output.newline(),
            Instruction::Glue => self.state.output.glue(),
            Instruction::Tag(id) => {
                let tag = self.string(*id)?;
                self.state.output.tag(&tag);
            }
            Instruction::BeginTag => self.state.output.begin_capture(CaptureKind::Tag),
            Instruction::EndTag => {
                let captured = self
                    .state
                    .output
                    .end_capture(CaptureKind::Tag)
                    .ok_or(Fault::UnbalancedCapture(ip.0))?;
                self.state.output.tag(&captured.text);
            }
            Instruction::BeginString => self.state.output.begin_capture(CaptureKind::String),
            Instruction::EndString => {
                let captured = self
                    .state
                    .output
                    .end_capture(CaptureKind::String)
                    .ok_or(Fault::UnbalancedCapture(ip.0))?;
                self.state.choice_tags.extend(captured.tags);
                self.push(Value::String(captured.text));
            }
            Instruction::Output => {
                let value = self.pop()?;
                let rendered = value.render(story.lists());
                self.state.output.text(&rendered);
            }

            Instruction::PushBool(b) => self.push(Value::Bool(*b)),
            Instruction::PushInt(i) => self.push(Value::Int(*i)),
            Instruction::PushFloat(f) => self.push(Value::Float(*f)),
            Instruction::PushString(id) => {
                let s = self.string(*id)?;
                self.push(Value::String(s));
            }
            Instruction::PushList(list) => self.push(Value::List(list.clone())),
            Instruction::PushDivert(target) => self.push(Value::DivertTarget(*target)),
            Instruction::Void => self.push(Value::None),
            Instruction::Pop => {
                self.pop()?;
            }
            Instruction::Duplicate => {
                let top = self
                    .state
                    .eval
                    .last()
                    .cloned()
                    .ok_or(Fault::StackUnderflow(ip.0))?;
                self.push(top);
            }
            Instruction::Binary(op) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = operators::binary(*op, lhs, rhs, story.lists(), &mut self.state.rng)?;
                self.push(result);
            }
            Instruction::Unary(op) => {
                let operand = self.pop()?;
                let result = match op {
                    UnaryOp::ReadCountOf => {
                        let id = self.target_container(&operand, "READ_COUNT")?;
                        Value::Int(self.globals.visits_of(id) as i32)
                    }
                    UnaryOp::TurnsSince => {
                        let id = self.target_container(&operand, "TURNS_SINCE")?;
                        let turns = self.globals.turns_since_id(id);
                        Value::Int(turns.map(|t| t as i32).unwrap_or(-1))
                    }
                    _ => operators::unary(*op, operand, story.lists(), &mut self.state.rng)?,
                };
                self.push(result);
            }
            Instruction::ListRange => {
                let max = self.pop()?;
                let min = self.pop()?;
                let list = self.pop()?;
                let bound = |v: &Value| match v {
                    Value::List(l) => Some(story.lists().value_of(l)),
                    other => other.as_int(),
                };
                let (Value::List(list), Some(lo), Some(hi)) = (&list, bound(&min), bound(&max)) else {
                    return Err(Fault::InvalidOperand {
                        op: "LIST_RANGE".to_string(),
                        operand: list.kind(),
                    }
                    .into());
                };
                let ranged = story.lists().range(list, lo, hi);
                self.push(Value::List(ranged));
            }

            Instruction::PushVariable(id) => {
                let name = self.string(*id)?;
                let value = self.read_variable(&name)?;
                self.push(value);
            }
            Instruction::PushVariablePointer(id) => {
                let name = self.string(*id)?;
                let pointer = self.pointer_to(&name)?;
                self.push(pointer);
            }
            Instruction::DefineTemp(id) => {
                let name = self.string(*id)?;
                let value = self.pop()?;
                self.state.frame_mut().locals.insert(name, value);
            }
            Instruction::SetVariable(id) => {
                let name = self.string(*id)?;
                let value = self.pop()?;
                self.write_variable(&name, value)?;
            }

            Instruction::Divert(target) => {
                if *target == ip {
                    return Err(Fault::NoProgress(ip.0).into());
                }
                next = *target;
            }
            Instruction::DivertIf(target) => {
                if self.pop()?.is_truthy() {
                    next = *target;
                }
            }
            Instruction::DivertToVariable(id) => {
                let name = self.string(*id)?;
                next = match self.read_variable(&name)? {
                    Value::DivertTarget(target) => target,
                    other => return Err(Fault::NotADivertTarget(other.kind()).into()),
                };
            }
            Instruction::Tunnel(target) => {
                self.state.frames.push(Frame::call(FrameKind::Tunnel, ip.next()));
                next = *target;
            }
            Instruction::TunnelReturn => {
                next = self.pop_frame(FrameKind::Tunnel, Fault::UnbalancedTunnelReturn)?;
            }
            Instruction::Call(target) => {
                self.state.frames.push(Frame::call(FrameKind::Function, ip.next()));
                self.state.output.function_start();
                next = *target;
            }
            Instruction::FunctionReturn => {
                next = self.pop_frame(FrameKind::Function, Fault::UnbalancedFunctionReturn)?;
                self.state.output.function_end();
            }
            Instruction::Thread(target) => {
                self.state.frames.push(Frame::call(FrameKind::Thread, ip.next()));
                next = *target;
            }
            Instruction::CallExternal {
                name,
                arity,
                fallback,
            } => {
                let name = self.string(*name)?;
                if looking_ahead && self.yields(&name) {
                    return Ok(Flow::Yield);
                }
                if let Some(target) = self.call_external(&name, *arity as usize, *fallback)? {
                    next = target;
                }
            }
            Instruction::Done => {
                if self.state.frame().kind == FrameKind::Thread && self.state.frames.len() > 1 {
                    next = self.pop_frame(FrameKind::Thread, Fault::UnbalancedFunctionReturn)?;
                } else {
                    self.end_of_flow();
                    return Ok(Flow::Continue);
                }
            }
            Instruction::End => {
                tracing::debug!(ip = ip.0, "story ended");
                self.state.choices.clear();
                self.state.status = Status::Done;
                return Ok(Flow::Continue);
            }

            Instruction::StartContainer(id) => self.globals.record_visit(*id),
            Instruction::VisitCount => {
                let visits = story
                    .container_at(ip)
                    .map(|id| self.globals.visits_of(id))
                    .unwrap_or(0);
                self.push(Value::Int(visits.saturating_sub(1) as i32));
            }
            Instruction::ReadCount(id) => {
                let visits = self.globals.visits_of(*id);
                self.push(Value::Int(visits as i32));
            }
            Instruction::Turn => {
                let turn = self.globals.turn();
                self.push(Value::Int(turn as i32));
            }
            Instruction::Shuffle => {
                let picked = self.shuffle()?;
                self.push(Value::Int(picked));
            }
            Instruction::SeedRandom => {
                let seed = self.pop_int("SEED_RANDOM")?;
                self.state.rng = RngState::new(seed as i64 as u64);
                self.push(Value::None);
            }
            Instruction::Choice { target, flags } => self.declare_choice(*target, *flags)?,
            Instruction::ChoiceCount => {
                let count = self.state.choices.len() as i32;
                self.push(Value::Int(count));
            }
        }

        self.state.ip = next;
        Ok(Flow::Continue)
    }

    /// Flow ran out: offer pending choices, take an invisible default if
    /// nothing else is on offer, or finish.
    pub(crate) fn end_of_flow(&mut self) {
        if self.state.choices.iter().any(|c| !c.invisible_default) {
            tracing::trace!(count = self.state.choices.len(), "awaiting choice");
            self.state.status = Status::AwaitingChoice;
            return;
        }
        let default = self
            .state
            .choices
            .iter()
            .find(|c| c.invisible_default)
            .cloned();
        match default {
            Some(choice) => self.take_choice(choice),
            None => self.state.status = Status::Done,
        }
    }

    fn push(&mut self, value: Value) {
        self.state.eval.push(value);
    }

    fn pop(&mut self) -> Result<Value, Fault> {
        self.state
            .eval
            .pop()
            .ok_or(Fault::StackUnderflow(self.state.ip.0))
    }

    fn pop_int(&mut self, op: &str) -> Result<i32, Fault> {
        let value = self.pop()?;
        value.as_int().ok_or_else(|| Fault::InvalidOperand {
            op: op.to_string(),
            operand: value.kind(),
        })
    }

    fn pop_text(&mut self) -> Result<String, Fault> {
        match self.pop()? {
            Value::String(s) => Ok(s),
            other => Ok(other.render(self.story.lists())),
        }
    }

    fn string(&self, id: StrId) -> Result<String, Fault> {
        self.story
            .string(id)
            .map(str::to_string)
            .ok_or(Fault::AddressOutOfRange(self.state.ip.0))
    }

    /// Pop the top frame, which must be of `kind`, and return where to go.
    fn pop_frame(&mut self, kind: FrameKind, fault: Fault) -> Result<Address, Fault> {
        let frame = self.state.frame();
        if frame.kind != kind || self.state.frames.len() < 2 {
            return Err(fault);
        }
        let Some(return_to) = frame.return_to else {
            return Err(fault);
        };
        self.state.frames.pop();
        Ok(return_to)
    }

    fn target_container(&self, operand: &Value, op: &str) -> Result<ContainerId, Fault> {
        let Value::DivertTarget(target) = operand else {
            return Err(Fault::InvalidOperand {
                op: op.to_string(),
                operand: operand.kind(),
            });
        };
        self.story
            .container_starting_at(*target)
            .or_else(|| self.story.container_at(*target))
            .ok_or(Fault::AddressOutOfRange(target.0))
    }

    // ---- variables ----

    fn read_variable(&self, name: &str) -> Result<Value, Fault> {
        let value = match self.state.frame().locals.get(name) {
            Some(local) => local.clone(),
            None => self.read_global(name)?,
        };
        match value {
            Value::Pointer { name, frame } => self.dereference(&name, frame),
            other => Ok(other),
        }
    }

    fn read_global(&self, name: &str) -> Result<Value, Fault> {
        let index = self
            .story
            .global_index(name)
            .ok_or_else(|| Fault::UnknownVariable(name.to_string()))?;
        Ok(self.globals.value_at(index))
    }

    fn dereference(&self, name: &str, frame: Option<u32>) -> Result<Value, Fault> {
        match frame {
            Some(depth) => self
                .state
                .frames
                .get(depth as usize)
                .and_then(|f| f.locals.get(name))
                .cloned()
                .ok_or_else(|| Fault::DanglingReference(name.to_string())),
            None => self.read_global(name),
        }
    }

    fn pointer_to(&self, name: &str) -> Result<Value, Fault> {
        let depth = self.state.frames.len() - 1;
        match self.state.frame().locals.get(name) {
            Some(pointer @ Value::Pointer { .. }) => Ok(pointer.clone()),
            Some(_) => Ok(Value::Pointer {
                name: name.to_string(),
                frame: Some(depth as u32),
            }),
            None if self.story.global_index(name).is_some() => Ok(Value::Pointer {
                name: name.to_string(),
                frame: None,
            }),
            None => Err(Fault::UnknownVariable(name.to_string())),
        }
    }

    fn write_variable(&mut self, name: &str, value: Value) -> Result<(), Fault> {
        match self.state.frame().locals.get(name) {
            Some(Value::Pointer { name: target, frame }) => {
                let (target, frame) = (target.clone(), *frame);
                self.write_through(&target, frame, value)
            }
            Some(_) => {
                self.state.frame_mut().locals.insert(name.to_string(), value);
                Ok(())
            }
            None => self.write_global(name, value),
        }
    }

    fn write_through(&mut self, name: &str, frame: Option<u32>, value: Value) -> Result<(), Fault> {
        match frame {
            Some(depth) => {
                let slot = self
                    .state
                    .frames
                    .get_mut(depth as usize)
                    .and_then(|f| f.locals.get_mut(name))
                    .ok_or_else(|| Fault::DanglingReference(name.to_string()))?;
                *slot = value;
                Ok(())
            }
            None => self.write_global(name, value),
        }
    }

    fn write_global(&mut self, name: &str, value: Value) -> Result<(), Fault> {
        let index = self
            .story
            .global_index(name)
            .ok_or_else(|| Fault::UnknownVariable(name.to_string()))?;
        self.globals.assign(index, value);
        Ok(())
    }

    // ---- externals ----

    /// Whether `name` is bound to a function that must not run during
    /// lookahead.
    fn yields(&self, name: &str) -> bool {
        self.callbacks
            .get(name)
            .is_some_and(|binding| !binding.is_lookahead_safe())
    }

    /// Call a host function, its story fallback or the fallback value.
    /// Returns the address to jump to when a story fallback runs. Nothing is
    /// consumed when the call fails, so the instruction can be retried.
    fn call_external(
        &mut self,
        name: &str,
        arity: usize,
        fallback: Option<Address>,
    ) -> Result<Option<Address>, RunnerError> {
        let ip = self.state.ip;
        let len = self.state.eval.len();
        if len < arity {
            return Err(Fault::StackUnderflow(ip.0).into());
        }

        if self.callbacks.is_bound(name) {
            let result = match self.callbacks.invoke(name, &self.state.eval[len - arity..]) {
                Some(result) => result?,
                None => return Err(RunnerError::UnboundExternalFunction(name.to_string())),
            };
            tracing::trace!(name, arity, "external function called");
            self.state.eval.truncate(len - arity);
            self.push(result);
            return Ok(None);
        }

        if let Some(target) = fallback {
            tracing::trace!(name, "running story fallback for external function");
            self.state.frames.push(Frame::call(FrameKind::Function, ip.next()));
            self.state.output.function_start();
            return Ok(Some(target));
        }

        match self.fallback.clone() {
            Some(value) => {
                self.state.eval.truncate(len - arity);
                self.push(value);
                Ok(None)
            }
            None => Err(RunnerError::UnboundExternalFunction(name.to_string())),
        }
    }

    // ---- sequences and choices ----

    /// Pick the next element of a shuffled sequence. Each pass through the
    /// sequence is a fresh permutation seeded by the container path, the
    /// pass number and the runner seed.
    fn shuffle(&mut self) -> Result<i32, Fault> {
        let count = self.pop_int("SHUFFLE")?;
        let sequence_index = self.pop_int("SHUFFLE")?;
        if count <= 0 {
            return Ok(0);
        }
        let count = count as usize;
        let sequence_index = sequence_index.max(0) as usize;
        let pass = sequence_index / count;
        let iteration = sequence_index % count;

        let path = self
            .story
            .container_at(self.state.ip)
            .and_then(|id| self.story.container(id))
            .map(|info| info.path.as_str())
            .unwrap_or_default();
        let seed = digest64(path.as_bytes())
            .wrapping_add(pass as u64)
            .wrapping_add(self.state.rng.seed);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut unpicked: Vec<usize> = (0..count).collect();
        let mut picked = 0;
        for _ in 0..=iteration {
            let at = rng.gen_range(0..unpicked.len());
            picked = unpicked.remove(at);
        }
        Ok(picked as i32)
    }

    fn declare_choice(&mut self, target: Address, flags: ChoiceFlags) -> Result<(), Fault> {
        let index = self.state.declared_choices;
        self.state.declared_choices += 1;

        let eligible = if flags.has_condition {
            self.pop()?.is_truthy()
        } else {
            true
        };
        let start = if flags.has_start_content {
            self.pop_text()?
        } else {
            String::new()
        };
        let choice_only = if flags.has_choice_only_content {
            self.pop_text()?
        } else {
            String::new()
        };
        let tags = std::mem::take(&mut self.state.choice_tags);

        if !eligible {
            return Ok(());
        }
        if flags.once_only {
            let seen = self
                .story
                .container_starting_at(target)
                .map(|id| self.globals.visits_of(id) > 0)
                .unwrap_or(false);
            if seen {
                return Ok(());
            }
        }

        let text = format!("{start}{choice_only}").trim().to_string();
        self.state.choices.push(PendingChoice {
            index,
            text,
            tags,
            target,
            frames: self.state.frames.clone(),
            invisible_default: flags.invisible_default,
        });
        Ok(())
    }
}
