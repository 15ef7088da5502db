//! Narrative Runtime: executes compiled branching narrative scripts.
//!
//! A [`Story`] is an immutable compiled program shared by any number of
//! [`Runner`]s. Runners produce lines of text and choice points; story
//! variables, visit counts and the turn counter live in a [`Globals`] store
//! that the runners of one story share. Hosts bind external functions to a
//! runner, observe variables on the globals, and save and restore everything
//! through a [`Snapshot`].

pub mod core;
pub mod schema;

pub use crate::core::builder::{ChoiceSpec, StoryBuilder};
pub use crate::core::callbacks::{CallbackError, Callbacks, FromValue, IntoValue};
pub use crate::core::globals::{Globals, GlobalsError};
pub use crate::core::runner::{Choice, Line, Runner, RunnerBuilder, RunnerError, Step};
pub use crate::core::snapshot::{Snapshot, SnapshotError};
pub use crate::core::state::{Fault, Status};
pub use crate::core::story::{Story, StoryError};
pub use crate::schema::list::{ListError, ListFlag, ListValue};
pub use crate::schema::value::{Value, ValueKind};
