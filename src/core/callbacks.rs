/// Host functions callable from the story.
///
/// Each binding is stored behind the `ExternalFunction` interface: arity,
/// per-argument kinds and an `invoke` over `Value`s. Typed Rust closures are
/// adapted through `FromValue`/`IntoValue`, so call sites are checked when
/// they are registered and arguments are checked when they are called.
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::marker::PhantomData;
use thiserror::Error;

use crate::schema::list::ListValue;
use crate::schema::value::{Value, ValueKind};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallbackError {
    #[error("argument {index} of '{name}' expected {expected}, found {found}")]
    ArgumentTypeMismatch {
        name: String,
        index: usize,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("'{name}' takes {expected} arguments but the story passes {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// Conversion from a story value into a native argument.
pub trait FromValue: Sized {
    /// Kind accepted, `None` when any value is.
    const KIND: Option<ValueKind>;

    fn from_value(value: &Value) -> Option<Self>;
}

/// Conversion from a native return value into a story value.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl FromValue for i32 {
    const KIND: Option<ValueKind> = Some(ValueKind::Int);

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl FromValue for u32 {
    const KIND: Option<ValueKind> = Some(ValueKind::UInt);

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl FromValue for f32 {
    const KIND: Option<ValueKind> = Some(ValueKind::Float);

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(_) | Value::Int(_) | Value::UInt(_) => value.as_float(),
            _ => None,
        }
    }
}

impl FromValue for bool {
    const KIND: Option<ValueKind> = Some(ValueKind::Bool);

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromValue for String {
    const KIND: Option<ValueKind> = Some(ValueKind::String);

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for ListValue {
    const KIND: Option<ValueKind> = Some(ValueKind::List);

    fn from_value(value: &Value) -> Option<Self> {
        value.as_list().cloned()
    }
}

impl FromValue for Value {
    const KIND: Option<ValueKind> = None;

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

macro_rules! impl_into_value {
    ($($t:ty),*) => {
        $(
            impl IntoValue for $t {
                fn into_value(self) -> Value {
                    self.into()
                }
            }
        )*
    };
}

impl_into_value!(bool, i32, u32, f32, String, &'static str, ListValue);

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::None
    }
}

/// Type-erased host function.
pub trait ExternalFunction {
    fn arity(&self) -> usize;

    /// Accepted kind of each argument, `None` for any.
    fn arg_kinds(&self) -> Vec<Option<ValueKind>>;

    /// `args` are in declaration order and always `arity()` long.
    fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, CallbackError>;
}

/// Adapter from a typed closure to `ExternalFunction`.
pub struct NativeFn<F, Args> {
    f: F,
    _args: PhantomData<fn(Args)>,
}

/// Closures that can be bound, keyed by their argument tuple and return type.
pub trait IntoExternal<Args, R> {
    fn into_external(self) -> Box<dyn ExternalFunction>;
}

fn mismatch<T: FromValue>(name: &str, index: usize, found: &Value) -> CallbackError {
    CallbackError::ArgumentTypeMismatch {
        name: name.to_string(),
        index,
        expected: T::KIND.unwrap_or(ValueKind::None),
        found: found.kind(),
    }
}

macro_rules! count {
    () => { 0usize };
    ($head:ident $($tail:ident)*) => { 1usize + count!($($tail)*) };
}

macro_rules! impl_native {
    ($($arg:ident $val:ident),*) => {
        impl<F, R, $($arg,)*> ExternalFunction for NativeFn<F, ($($arg,)*)>
        where
            F: Fn($($arg),*) -> R,
            R: IntoValue,
            $($arg: FromValue,)*
        {
            fn arity(&self) -> usize {
                count!($($arg)*)
            }

            fn arg_kinds(&self) -> Vec<Option<ValueKind>> {
                vec![$($arg::KIND),*]
            }

            #[allow(unused_variables, unused_mut)]
            fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, CallbackError> {
                let arity = count!($($arg)*);
                let mut index = 0usize;
                $(
                    let $val = {
                        let raw = args.get(index).ok_or_else(|| CallbackError::ArityMismatch {
                            name: name.to_string(),
                            expected: arity,
                            found: args.len(),
                        })?;
                        let converted = $arg::from_value(raw)
                            .ok_or_else(|| mismatch::<$arg>(name, index, raw))?;
                        index += 1;
                        converted
                    };
                )*
                Ok((self.f)($($val),*).into_value())
            }
        }

        impl<F, R, $($arg,)*> IntoExternal<($($arg,)*), R> for F
        where
            F: Fn($($arg),*) -> R + 'static,
            R: IntoValue + 'static,
            $($arg: FromValue + 'static,)*
        {
            fn into_external(self) -> Box<dyn ExternalFunction> {
                Box::new(NativeFn::<F, ($($arg,)*)> {
                    f: self,
                    _args: PhantomData,
                })
            }
        }
    };
}

impl_native!();
impl_native!(A a);
impl_native!(A a, B b);
impl_native!(A a, B b, C c);
impl_native!(A a, B b, C c, D d);

/// A binding over raw values with explicit arity and kinds.
struct RawFn<F> {
    arity: usize,
    kinds: Vec<Option<ValueKind>>,
    f: F,
}

impl<F> ExternalFunction for RawFn<F>
where
    F: Fn(&[Value]) -> Value,
{
    fn arity(&self) -> usize {
        self.arity
    }

    fn arg_kinds(&self) -> Vec<Option<ValueKind>> {
        self.kinds.clone()
    }

    fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, CallbackError> {
        for (index, (arg, kind)) in args.iter().zip(&self.kinds).enumerate() {
            if let Some(kind) = kind {
                if arg.kind() != *kind {
                    return Err(CallbackError::ArgumentTypeMismatch {
                        name: name.to_string(),
                        index,
                        expected: *kind,
                        found: arg.kind(),
                    });
                }
            }
        }
        Ok((self.f)(args))
    }
}

/// A registered function and how the runner may call it.
pub struct Binding {
    function: Box<dyn ExternalFunction>,
    lookahead_safe: bool,
}

impl Binding {
    /// Allow the runner to call this function while it looks ahead past the
    /// end of a line for glue. Only side-effect-free functions should be
    /// marked safe, since lookahead may call them more than once.
    pub fn lookahead_safe(&mut self, safe: bool) -> &mut Self {
        self.lookahead_safe = safe;
        self
    }

    pub fn is_lookahead_safe(&self) -> bool {
        self.lookahead_safe
    }

    pub fn function(&self) -> &dyn ExternalFunction {
        self.function.as_ref()
    }
}

/// Registry of host functions keyed by the name the story calls.
#[derive(Default)]
pub struct Callbacks {
    bindings: FxHashMap<String, Binding>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<Args, R, F>(&mut self, name: &str, f: F) -> &mut Binding
    where
        F: IntoExternal<Args, R>,
    {
        self.insert(name, f.into_external())
    }

    /// Bind a function whose result the story does not use.
    pub fn bind_void<Args, F>(&mut self, name: &str, f: F) -> &mut Binding
    where
        F: IntoExternal<Args, ()>,
    {
        self.insert(name, f.into_external())
    }

    /// Bind over raw values. Arguments whose kind is `Some` are checked
    /// before `f` runs.
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
        let mut kinds = kinds;
        kinds.resize(arity, None);
        self.insert(name, Box::new(RawFn { arity, kinds, f }))
    }

    /// Bind an already type-erased function.
    pub fn bind_dyn(&mut self, name: &str, function: Box<dyn ExternalFunction>) -> &mut Binding {
        self.insert(name, function)
    }

    fn insert(&mut self, name: &str, function: Box<dyn ExternalFunction>) -> &mut Binding {
        tracing::debug!(function = name, arity = function.arity(), "external function bound");
        let binding = Binding {
            function,
            lookahead_safe: false,
        };
        match self.bindings.entry(name.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(binding);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(binding),
        }
    }

    pub fn unbind(&mut self, name: &str) -> bool {
        self.bindings.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Call `name` with `args`, checking arity first.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Option<Result<Value, CallbackError>> {
        let binding = self.bindings.get(name)?;
        let expected = binding.function.arity();
        if expected != args.len() {
            return Some(Err(CallbackError::ArityMismatch {
                name: name.to_string(),
                expected,
                found: args.len(),
            }));
        }
        Some(binding.function.invoke(name, args))
    }
}
