/// List values: sets of named flags drawn from declared list origins.
///
/// A `ListValue` is a plain value (identity only, no names). Everything that
/// needs flag names or declared integer values goes through the story's
/// `ListTable`.
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListError {
    #[error("unknown list origin: {0}")]
    UnknownOrigin(String),
    #[error("unknown list flag: {0}")]
    UnknownFlag(String),
    #[error("flag '{name}' is declared in more than one list ({origins}); qualify it as origin.flag")]
    AmbiguousFlag { name: String, origins: String },
    #[error("list flag {origin}:{index} is not declared")]
    UndeclaredFlag { origin: u16, index: u16 },
}

/// Identity of one flag: the origin it belongs to and its position in that
/// origin's declaration. Ordering is declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListFlag {
    pub origin: u16,
    pub index: u16,
}

impl ListFlag {
    pub fn new(origin: u16, index: u16) -> Self {
        Self { origin, index }
    }
}

/// An ordered set of flags.
///
/// Besides the flags themselves the value remembers which origins it was
/// drawn from, so that an empty list still knows what "all" means for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListValue {
    flags: BTreeSet<ListFlag>,
    origins: BTreeSet<u16>,
}

impl PartialEq for ListValue {
    fn eq(&self, other: &Self) -> bool {
        self.flags == other.flags
    }
}

impl ListValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty list that still belongs to `origin`.
    pub fn empty_of(origin: u16) -> Self {
        let mut list = Self::default();
        list.origins.insert(origin);
        list
    }

    pub fn from_flags(flags: impl IntoIterator<Item = ListFlag>) -> Self {
        let mut list = Self::default();
        for flag in flags {
            list.insert(flag);
        }
        list
    }

    pub fn insert(&mut self, flag: ListFlag) -> bool {
        self.origins.insert(flag.origin);
        self.flags.insert(flag)
    }

    pub fn remove(&mut self, flag: ListFlag) -> bool {
        self.flags.remove(&flag)
    }

    pub fn contains(&self, flag: ListFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn count(&self) -> usize {
        self.flags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ListFlag> + '_ {
        self.flags.iter().copied()
    }

    pub fn origins(&self) -> impl Iterator<Item = u16> + '_ {
        self.origins.iter().copied()
    }

    pub fn union(&self, other: &ListValue) -> ListValue {
        ListValue {
            flags: self.flags.union(&other.flags).copied().collect(),
            origins: self.origins.union(&other.origins).copied().collect(),
        }
    }

    pub fn difference(&self, other: &ListValue) -> ListValue {
        ListValue {
            flags: self.flags.difference(&other.flags).copied().collect(),
            origins: self.origins.clone(),
        }
    }

    pub fn intersection(&self, other: &ListValue) -> ListValue {
        ListValue {
            flags: self.flags.intersection(&other.flags).copied().collect(),
            origins: self.origins.union(&other.origins).copied().collect(),
        }
    }

    /// `self ? other`: true when `other` is non-empty and every one of its
    /// flags is in `self`.
    pub fn has(&self, other: &ListValue) -> bool {
        !other.is_empty() && other.flags.is_subset(&self.flags)
    }

    pub fn hasnt(&self, other: &ListValue) -> bool {
        !self.has(other)
    }

    /// The flag declared earliest within its own origin. Across origins the
    /// one from the origin declared first wins a tie.
    pub fn min_flag(&self) -> Option<ListFlag> {
        self.flags.iter().copied().min_by_key(|f| f.index)
    }

    /// The flag declared latest within its own origin, ties going to the
    /// origin declared first.
    pub fn max_flag(&self) -> Option<ListFlag> {
        self.flags.iter().rev().copied().max_by_key(|f| f.index)
    }

    /// The smallest flag as a single-element list (empty if `self` is).
    pub fn min(&self) -> ListValue {
        self.single_or_empty(self.min_flag())
    }

    pub fn max(&self) -> ListValue {
        self.single_or_empty(self.max_flag())
    }

    fn single_or_empty(&self, flag: Option<ListFlag>) -> ListValue {
        let mut out = ListValue {
            flags: BTreeSet::new(),
            origins: self.origins.clone(),
        };
        if let Some(flag) = flag {
            out.insert(flag);
        }
        out
    }
}

/// One declared flag of an origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagDecl {
    pub name: String,
    pub value: i32,
}

/// A declared list origin (`LIST colours = red, green, blue`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListOrigin {
    pub name: String,
    pub flags: Vec<FlagDecl>,
}

/// All list origins of a story, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListTable {
    pub origins: Vec<ListOrigin>,
}

impl ListTable {
    pub fn origin(&self, origin: u16) -> Option<&ListOrigin> {
        self.origins.get(origin as usize)
    }

    pub fn origin_index(&self, name: &str) -> Option<u16> {
        self.origins
            .iter()
            .position(|o| o.name == name)
            .map(|i| i as u16)
    }

    fn decl(&self, flag: ListFlag) -> Option<&FlagDecl> {
        self.origin(flag.origin)?.flags.get(flag.index as usize)
    }

    pub fn is_declared(&self, flag: ListFlag) -> bool {
        self.decl(flag).is_some()
    }

    pub fn validate(&self, list: &ListValue) -> Result<(), ListError> {
        for flag in list.iter() {
            if !self.is_declared(flag) {
                return Err(ListError::UndeclaredFlag {
                    origin: flag.origin,
                    index: flag.index,
                });
            }
        }
        Ok(())
    }

    pub fn flag_name(&self, flag: ListFlag) -> Option<&str> {
        self.decl(flag).map(|d| d.name.as_str())
    }

    pub fn flag_value(&self, flag: ListFlag) -> Option<i32> {
        self.decl(flag).map(|d| d.value)
    }

    /// `origin.flag` form of a flag's name.
    pub fn qualified_name(&self, flag: ListFlag) -> Option<String> {
        let origin = self.origin(flag.origin)?;
        let decl = origin.flags.get(flag.index as usize)?;
        Some(format!("{}.{}", origin.name, decl.name))
    }

    fn candidates(&self, name: &str) -> Vec<ListFlag> {
        let mut found = Vec::new();
        for (oi, origin) in self.origins.iter().enumerate() {
            if let Some(fi) = origin.flags.iter().position(|f| f.name == name) {
                found.push(ListFlag::new(oi as u16, fi as u16));
            }
        }
        found
    }

    /// Whether a bare flag name exists in more than one origin.
    pub fn is_ambiguous(&self, name: &str) -> bool {
        self.candidates(name).len() > 1
    }

    /// Resolve `flag` or `origin.flag` to its identity.
    ///
    /// A bare name declared in two origins is rejected; the qualified form
    /// always resolves.
    pub fn flag_by_name(&self, name: &str) -> Result<ListFlag, ListError> {
        if let Some((origin_name, flag_name)) = name.split_once('.') {
            let origin = self
                .origin_index(origin_name)
                .ok_or_else(|| ListError::UnknownOrigin(origin_name.to_string()))?;
            let index = self.origins[origin as usize]
                .flags
                .iter()
                .position(|f| f.name == flag_name)
                .ok_or_else(|| ListError::UnknownFlag(name.to_string()))?;
            return Ok(ListFlag::new(origin, index as u16));
        }

        let candidates = self.candidates(name);
        match candidates.as_slice() {
            [] => Err(ListError::UnknownFlag(name.to_string())),
            [flag] => Ok(*flag),
            many => Err(ListError::AmbiguousFlag {
                name: name.to_string(),
                origins: many
                    .iter()
                    .filter_map(|f| self.origin(f.origin).map(|o| o.name.clone()))
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Build a list from flag names (bare or qualified).
    pub fn list_of(&self, names: &[&str]) -> Result<ListValue, ListError> {
        let mut list = ListValue::new();
        for name in names {
            list.insert(self.flag_by_name(name)?);
        }
        Ok(list)
    }

    /// Membership test by name.
    pub fn contains_named(&self, list: &ListValue, name: &str) -> Result<bool, ListError> {
        Ok(list.contains(self.flag_by_name(name)?))
    }

    /// Every flag of the named origin.
    pub fn all_of_origin(&self, name: &str) -> Result<ListValue, ListError> {
        let origin = self
            .origin_index(name)
            .ok_or_else(|| ListError::UnknownOrigin(name.to_string()))?;
        Ok(self.all_of(origin))
    }

    fn all_of(&self, origin: u16) -> ListValue {
        let mut list = ListValue::empty_of(origin);
        if let Some(o) = self.origin(origin) {
            for index in 0..o.flags.len() {
                list.insert(ListFlag::new(origin, index as u16));
            }
        }
        list
    }

    /// `LIST_ALL`: every flag of every origin the list draws from.
    pub fn all(&self, list: &ListValue) -> ListValue {
        list.origins()
            .fold(ListValue::new(), |acc, origin| acc.union(&self.all_of(origin)))
    }

    /// `LIST_INVERT`: the flags of the list's origins that it does not hold.
    pub fn invert(&self, list: &ListValue) -> ListValue {
        let mut inverted = self.all(list).difference(list);
        for origin in list.origins() {
            inverted.origins.insert(origin);
        }
        inverted
    }

    /// Flags whose declared value lies in `min..=max`.
    pub fn range(&self, list: &ListValue, min: i32, max: i32) -> ListValue {
        let mut out = ListValue::new();
        out.origins = list.origins.clone();
        for flag in list.iter() {
            if let Some(value) = self.flag_value(flag) {
                if value >= min && value <= max {
                    out.insert(flag);
                }
            }
        }
        out
    }

    /// `list + n`: move every flag to the flag of the same origin whose value
    /// is `n` higher. Flags that fall off the end are dropped.
    pub fn shift(&self, list: &ListValue, delta: i32) -> ListValue {
        let mut out = ListValue::new();
        out.origins = list.origins.clone();
        for flag in list.iter() {
            let Some(value) = self.flag_value(flag) else {
                continue;
            };
            if let Some(moved) = self.flag_with_value(flag.origin, value.wrapping_add(delta)) {
                out.insert(moved);
            }
        }
        out
    }

    pub fn flag_with_value(&self, origin: u16, value: i32) -> Option<ListFlag> {
        let o = self.origin(origin)?;
        o.flags
            .iter()
            .position(|f| f.value == value)
            .map(|i| ListFlag::new(origin, i as u16))
    }

    /// `Origin(n)`: the flag with value `n` in the first origin of `list`.
    pub fn from_int(&self, list: &ListValue, value: i32) -> ListValue {
        let mut out = ListValue::new();
        out.origins = list.origins.clone();
        if let Some(origin) = list.origins().next() {
            if let Some(flag) = self.flag_with_value(origin, value) {
                out.insert(flag);
            }
        }
        out
    }

    /// `LIST_VALUE`: declared value of the largest flag, 0 for an empty list.
    pub fn value_of(&self, list: &ListValue) -> i32 {
        list.max_flag()
            .and_then(|f| self.flag_value(f))
            .unwrap_or(0)
    }

    /// Comma-joined flag names in declaration order. Names that exist in
    /// more than one origin are written as `origin.flag`.
    pub fn render(&self, list: &ListValue) -> String {
        let mut parts = Vec::with_capacity(list.count());
        for flag in list.iter() {
            let Some(name) = self.flag_name(flag) else {
                continue;
            };
            if self.is_ambiguous(name) {
                if let Some(qualified) = self.qualified_name(flag) {
                    parts.push(qualified);
                    continue;
                }
            }
            parts.push(name.to_string());
        }
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ListTable {
        let origin = |name: &str, flags: &[&str]| ListOrigin {
            name: name.to_string(),
            flags: flags
                .iter()
                .enumerate()
                .map(|(i, f)| FlagDecl {
                    name: f.to_string(),
                    value: i as i32 + 1,
                })
                .collect(),
        };
        ListTable {
            origins: vec![
                origin("animals", &["cat", "dog", "bird"]),
                origin("colours", &["white", "red", "black"]),
                origin("moods", &["calm", "red"]),
            ],
        }
    }

    #[test]
    fn bare_and_qualified_lookup() {
        let t = table();
        assert_eq!(t.flag_by_name("dog").unwrap(), ListFlag::new(0, 1));
        assert_eq!(t.flag_by_name("moods.red").unwrap(), ListFlag::new(2, 1));
        assert!(matches!(
            t.flag_by_name("red"),
            Err(ListError::AmbiguousFlag { .. })
        ));
        assert!(matches!(
            t.flag_by_name("fish"),
            Err(ListError::UnknownFlag(_))
        ));
        assert!(matches!(
            t.flag_by_name("plants.fern"),
            Err(ListError::UnknownOrigin(_))
        ));
    }

    #[test]
    fn render_qualifies_only_ambiguous_names() {
        let t = table();
        let list = t
            .list_of(&["bird", "white", "colours.red", "moods.calm"])
            .unwrap();
        assert_eq!(t.render(&list), "bird, white, colours.red, calm");
    }

    #[test]
    fn min_max_follow_declaration_order() {
        let t = table();
        let list = t.list_of(&["bird", "cat"]).unwrap();
        assert_eq!(t.render(&list.min()), "cat");
        assert_eq!(t.render(&list.max()), "bird");
        assert!(ListValue::new().min().is_empty());
    }

    #[test]
    fn empty_list_remembers_origin() {
        let t = table();
        let empty = ListValue::empty_of(1);
        assert_eq!(t.render(&t.all(&empty)), "white, colours.red, black");
        assert_eq!(t.invert(&empty).count(), 3);
        assert_eq!(empty, ListValue::new());
    }

    #[test]
    fn shift_range_and_value() {
        let t = table();
        let list = t.list_of(&["cat", "dog"]).unwrap();
        assert_eq!(t.render(&t.shift(&list, 1)), "dog, bird");
        assert_eq!(t.render(&t.shift(&list, 2)), "bird");
        let all = t.all_of_origin("animals").unwrap();
        assert_eq!(t.render(&t.range(&all, 2, 3)), "dog, bird");
        assert_eq!(t.value_of(&list), 2);
        assert_eq!(t.render(&t.from_int(&list, 3)), "bird");
    }

    #[test]
    fn has_requires_non_empty_subset() {
        let t = table();
        let list = t.list_of(&["cat", "dog"]).unwrap();
        assert!(list.has(&t.list_of(&["cat"]).unwrap()));
        assert!(!list.has(&t.list_of(&["cat", "bird"]).unwrap()));
        assert!(!list.has(&ListValue::new()));
        assert!(list.hasnt(&t.list_of(&["bird"]).unwrap()));
    }
}
