/// The globals store shared by every runner of one story session.
///
/// Holds variable values, per-container visit counters and the turn index.
/// `Globals` is a cheap handle; clones share the same store.
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

use crate::core::callbacks::FromValue;
use crate::core::snapshot::{Snapshot, SnapshotError};
use crate::core::story::Story;
use crate::schema::instruction::ContainerId;
use crate::schema::list::{ListError, ListTable};
use crate::schema::value::{Value, ValueKind};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GlobalsError {
    #[error("undeclared variable: {0}")]
    UndeclaredVariable(String),
    #[error("type mismatch for '{name}': expected {expected}, found {found}")]
    TypeMismatch {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("list error: {0}")]
    List(#[from] ListError),
    #[error("unknown path: {0}")]
    UnknownPath(String),
}

/// Serializable contents of a globals store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    /// In declaration order.
    pub variables: Vec<Value>,
    /// Indexed by container.
    pub visits: Vec<u32>,
    /// Turn at which each container was last entered.
    pub turn_marks: Vec<Option<u32>>,
    pub turn: u32,
}

impl GlobalState {
    pub fn fresh(story: &Story) -> Self {
        let containers = story.container_count();
        Self {
            variables: story.global_decls().iter().map(|g| g.default.clone()).collect(),
            visits: vec![0; containers],
            turn_marks: vec![None; containers],
            turn: 0,
        }
    }

    /// Whether this state has the shape `story` expects.
    pub fn fits(&self, story: &Story) -> bool {
        self.variables.len() == story.global_decls().len()
            && self.visits.len() == story.container_count()
            && self.turn_marks.len() == story.container_count()
    }
}

type Observer = Rc<dyn Fn(&Value, &Value)>;

struct Change {
    variable: usize,
    old: Value,
    new: Value,
}

struct GlobalStore {
    state: GlobalState,
    observers: Vec<(usize, Observer)>,
    /// While a runner looks ahead, changes queue here instead of notifying.
    deferred: Option<Vec<Change>>,
}

#[derive(Clone)]
pub struct Globals {
    story: Story,
    inner: Rc<RefCell<GlobalStore>>,
}

impl fmt::Debug for Globals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.inner.borrow();
        f.debug_struct("Globals")
            .field("state", &store.state)
            .field("observers", &store.observers.len())
            .finish()
    }
}

impl Globals {
    pub(crate) fn new(story: Story) -> Self {
        let state = GlobalState::fresh(&story);
        Self::with_state(story, state)
    }

    pub(crate) fn with_state(story: Story, state: GlobalState) -> Self {
        Self {
            story,
            inner: Rc::new(RefCell::new(GlobalStore {
                state,
                observers: Vec::new(),
                deferred: None,
            })),
        }
    }

    pub fn story(&self) -> &Story {
        &self.story
    }

    /// Whether two handles share one store.
    pub fn ptr_eq(&self, other: &Globals) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn index_of(&self, name: &str) -> Result<usize, GlobalsError> {
        self.story
            .global_index(name)
            .ok_or_else(|| GlobalsError::UndeclaredVariable(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<Value, GlobalsError> {
        let index = self.index_of(name)?;
        Ok(self.inner.borrow().state.variables[index].clone())
    }

    /// Typed read.
    pub fn get_as<T: FromValue>(&self, name: &str) -> Result<T, GlobalsError> {
        let value = self.get(name)?;
        T::from_value(&value).ok_or_else(|| GlobalsError::TypeMismatch {
            name: name.to_string(),
            expected: T::KIND.unwrap_or(ValueKind::None),
            found: value.kind(),
        })
    }

    /// Assign a declared variable and notify its observers.
    ///
    /// The value must fit the kind of the declared default: integers widen
    /// into floats and convert between signed and unsigned when the number
    /// fits; anything else is a `TypeMismatch`.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), GlobalsError> {
        let index = self.index_of(name)?;
        let declared = self.story.global_decls()[index].default.kind();
        let value = value.into();
        let found = value.kind();
        let value = coerce(value, declared, self.story.lists())?.ok_or_else(|| {
            tracing::warn!(variable = name, %declared, %found, "rejected global assignment");
            GlobalsError::TypeMismatch {
                name: name.to_string(),
                expected: declared,
                found,
            }
        })?;
        self.assign(index, value);
        Ok(())
    }

    /// Register `callback(old, new)` for changes to `name`. Callbacks run in
    /// registration order once the new value is readable through `get`.
    pub fn observe(
        &self,
        name: &str,
        callback: impl Fn(&Value, &Value) + 'static,
    ) -> Result<(), GlobalsError> {
        let index = self.index_of(name)?;
        self.inner
            .borrow_mut()
            .observers
            .push((index, Rc::new(callback)));
        Ok(())
    }

    pub fn visit_count(&self, path: &str) -> Result<u32, GlobalsError> {
        let id = self.container(path)?;
        Ok(self.visits_of(id))
    }

    /// Turns since `path` was last entered, `None` if it never was.
    pub fn turns_since(&self, path: &str) -> Result<Option<u32>, GlobalsError> {
        let id = self.container(path)?;
        Ok(self.turns_since_id(id))
    }

    pub fn turn(&self) -> u32 {
        self.inner.borrow().state.turn
    }

    /// Capture this store with no runners.
    pub fn snapshot(&self) -> Result<Snapshot, SnapshotError> {
        Snapshot::capture(self, &[])
    }

    fn container(&self, path: &str) -> Result<ContainerId, GlobalsError> {
        self.story
            .container_by_path(path)
            .ok_or_else(|| GlobalsError::UnknownPath(path.to_string()))
    }

    // ---- runner side ----

    pub(crate) fn state(&self) -> GlobalState {
        self.inner.borrow().state.clone()
    }

    pub(crate) fn restore_state(&self, state: GlobalState) {
        self.inner.borrow_mut().state = state;
    }

    /// Put visit counters and turn marks back, leaving variables as they are.
    pub(crate) fn restore_counters(&self, visits: Vec<u32>, turn_marks: Vec<Option<u32>>) {
        let mut store = self.inner.borrow_mut();
        store.state.visits = visits;
        store.state.turn_marks = turn_marks;
    }

    pub(crate) fn value_at(&self, index: usize) -> Value {
        self.inner.borrow().state.variables[index].clone()
    }

    /// Story-side assignment. Kinds are not checked.
    pub(crate) fn assign(&self, index: usize, value: Value) {
        let notify = {
            let mut store = self.inner.borrow_mut();
            let old = std::mem::replace(&mut store.state.variables[index], value.clone());
            if old == value && old.kind() == value.kind() {
                return;
            }
            if let Some(queue) = store.deferred.as_mut() {
                queue.push(Change {
                    variable: index,
                    old,
                    new: value,
                });
                return;
            }
            (observers_of(&store, index), old, value)
        };
        let (observers, old, new) = notify;
        for observer in observers {
            observer(&old, &new);
        }
    }

    pub(crate) fn record_visit(&self, id: ContainerId) {
        let Some(info) = self.story.container(id) else {
            return;
        };
        let (count_visits, count_turns) = (info.count_visits, info.count_turns);
        let mut store = self.inner.borrow_mut();
        let turn = store.state.turn;
        let i = id.0 as usize;
        if count_visits {
            store.state.visits[i] = store.state.visits[i].saturating_add(1);
        }
        if count_turns {
            store.state.turn_marks[i] = Some(turn);
        }
    }

    pub(crate) fn visits_of(&self, id: ContainerId) -> u32 {
        self.inner
            .borrow()
            .state
            .visits
            .get(id.0 as usize)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn turns_since_id(&self, id: ContainerId) -> Option<u32> {
        let store = self.inner.borrow();
        let mark = store.state.turn_marks.get(id.0 as usize).copied().flatten()?;
        Some(store.state.turn.saturating_sub(mark))
    }

    pub(crate) fn next_turn(&self) {
        let mut store = self.inner.borrow_mut();
        store.state.turn = store.state.turn.saturating_add(1);
    }

    pub(crate) fn begin_deferral(&self) {
        let mut store = self.inner.borrow_mut();
        if store.deferred.is_none() {
            store.deferred = Some(Vec::new());
        }
    }

    /// Deliver queued changes and stop deferring.
    pub(crate) fn flush_deferred(&self) {
        let changes = self.inner.borrow_mut().deferred.take().unwrap_or_default();
        for change in changes {
            let observers = observers_of(&self.inner.borrow(), change.variable);
            for observer in observers {
                observer(&change.old, &change.new);
            }
        }
    }

    /// Drop queued changes; the caller restores the values themselves.
    pub(crate) fn discard_deferred(&self) {
        self.inner.borrow_mut().deferred = None;
    }
}

fn observers_of(store: &GlobalStore, index: usize) -> Vec<Observer> {
    store
        .observers
        .iter()
        .filter(|(i, _)| *i == index)
        .map(|(_, o)| o.clone())
        .collect()
}

/// Fit `value` to a variable declared as `declared`. `Ok(None)` means the
/// kinds are incompatible.
fn coerce(value: Value, declared: ValueKind, lists: &ListTable) -> Result<Option<Value>, ListError> {
    let fitted = match (declared, value) {
        (ValueKind::List, Value::List(list)) => {
            lists.validate(&list)?;
            Some(Value::List(list))
        }
        (ValueKind::None, v) => Some(v),
        (k, v) if v.kind() == k => Some(v),
        (ValueKind::Float, Value::Int(i)) => Some(Value::Float(i as f32)),
        (ValueKind::Float, Value::UInt(u)) => Some(Value::Float(u as f32)),
        (ValueKind::Int, Value::UInt(u)) => i32::try_from(u).ok().map(Value::Int),
        (ValueKind::UInt, Value::Int(i)) => u32::try_from(i).ok().map(Value::UInt),
        _ => None,
    };
    Ok(fitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::StoryBuilder;
    use std::cell::RefCell;

    fn story() -> Story {
        let mut b = StoryBuilder::new();
        b.list_origin("colours", &["red", "green"]);
        b.global("score", 0)
            .global("ratio", 0.5f32)
            .global("name", "Ada")
            .global_list("paint", "colours", &["red"]);
        b.begin_knot("start").line("hi");
        b.finish().unwrap()
    }

    #[test]
    fn defaults_and_undeclared() {
        let globals = story().new_globals();
        assert_eq!(globals.get("score").unwrap(), Value::Int(0));
        assert_eq!(globals.get_as::<String>("name").unwrap(), "Ada");
        assert_eq!(
            globals.get("missing"),
            Err(GlobalsError::UndeclaredVariable("missing".to_string()))
        );
        assert!(globals.set("missing", 1).is_err());
    }

    #[test]
    fn numeric_widening_and_mismatch() {
        let globals = story().new_globals();
        globals.set("ratio", 2).unwrap();
        assert_eq!(globals.get("ratio").unwrap(), Value::Float(2.0));
        globals.set("score", 7u32).unwrap();
        assert_eq!(globals.get("score").unwrap(), Value::Int(7));
        assert!(matches!(
            globals.set("score", 1.5f32),
            Err(GlobalsError::TypeMismatch { .. })
        ));
        assert!(matches!(
            globals.set("paint", 3),
            Err(GlobalsError::TypeMismatch { .. })
        ));
        assert_eq!(globals.get("score").unwrap(), Value::Int(7));
    }

    #[test]
    fn observers_see_committed_value_in_order() {
        let globals = story().new_globals();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let log = log.clone();
            let handle = globals.clone();
            globals
                .observe("score", move |old, new| {
                    let now = handle.get("score").unwrap();
                    log.borrow_mut()
                        .push(format!("{tag}:{old:?}->{new:?}:{now:?}"));
                })
                .unwrap();
        }
        globals.set("score", 3).unwrap();
        assert_eq!(
            *log.borrow(),
            vec![
                "first:Int(0)->Int(3):Int(3)".to_string(),
                "second:Int(0)->Int(3):Int(3)".to_string(),
            ]
        );
    }

    #[test]
    fn deferred_changes_flush_or_discard() {
        let globals = story().new_globals();
        let hits = Rc::new(RefCell::new(0));
        let counter = hits.clone();
        globals
            .observe("score", move |_, _| *counter.borrow_mut() += 1)
            .unwrap();

        globals.begin_deferral();
        globals.assign(0, Value::Int(4));
        assert_eq!(*hits.borrow(), 0);
        globals.flush_deferred();
        assert_eq!(*hits.borrow(), 1);

        let saved = globals.state();
        globals.begin_deferral();
        globals.assign(0, Value::Int(9));
        globals.restore_state(saved);
        globals.discard_deferred();
        assert_eq!(*hits.borrow(), 1);
        assert_eq!(globals.get("score").unwrap(), Value::Int(4));
    }

    #[test]
    fn list_flags_must_be_declared() {
        let story = story();
        let globals = story.new_globals();
        let green = story.lists().list_of(&["green"]).unwrap();
        globals.set("paint", green.clone()).unwrap();
        assert_eq!(globals.get_as::<crate::schema::list::ListValue>("paint").unwrap(), green);
    }
}
