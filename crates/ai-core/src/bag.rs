use std::borrow::Cow;
use std::marker::PhantomData;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{FromValue, Value, ValueKind};

/// Typed index into a [`PropertyBag`].
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropKey<T: 'static> {
    index: u16,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: 'static> Copy for PropKey<T> {}

impl<T: 'static> Clone for PropKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: 'static> PropKey<T> {
    pub const fn new(index: u16) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    pub fn index(self) -> u16 {
        self.index
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PropertyDesc {
    pub name: Cow<'static, str>,
    pub kind: ValueKind,
}

/// Ordered, schema-typed key/value bag.
///
/// The schema (names and kinds) is fixed by the first value written under each name; later writes
/// must keep the kind. Parameters, node instance data and event payloads all use this layout so
/// copy batches can address fields by index.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PropertyBag {
    names: Vec<Cow<'static, str>>,
    values: Vec<Value>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<Cow<'static, str>>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Adds or overwrites a property, returning its index. Overwriting with another kind replaces
    /// the declared kind.
    pub fn insert(&mut self, name: impl Into<Cow<'static, str>>, value: impl Into<Value>) -> u16 {
        let name = name.into();
        let value = value.into();
        if let Some(index) = self.index_of(&name) {
            self.values[index as usize] = value;
            return index;
        }
        self.names.push(name);
        self.values.push(value);
        (self.values.len() - 1) as u16
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<u16> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|index| index as u16)
    }

    pub fn key<T: FromValue + 'static>(&self, name: &str) -> Option<PropKey<T>> {
        let index = self.index_of(name)?;
        (self.values[index as usize].kind() == T::KIND).then(|| PropKey::new(index))
    }

    pub fn get(&self, index: u16) -> Option<&Value> {
        self.values.get(index as usize)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.get(self.index_of(name)?)
    }

    pub fn kind_of(&self, index: u16) -> Option<ValueKind> {
        self.get(index).map(Value::kind)
    }

    /// Writes `value` if the slot exists and has the same kind.
    pub fn set(&mut self, index: u16, value: Value) -> bool {
        match self.values.get_mut(index as usize) {
            Some(slot) if slot.kind() == value.kind() => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    pub fn set_by_name(&mut self, name: &str, value: impl Into<Value>) -> bool {
        match self.index_of(name) {
            Some(index) => self.set(index, value.into()),
            None => false,
        }
    }

    pub fn read<T: FromValue + 'static>(&self, key: PropKey<T>) -> Option<T> {
        self.get(key.index()).and_then(T::from_value)
    }

    pub fn write<T: FromValue + Into<Value> + 'static>(&mut self, key: PropKey<T>, value: T) -> bool {
        self.set(key.index(), value.into())
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get_by_name(name).and_then(Value::as_bool)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get_by_name(name).and_then(Value::as_int)
    }

    pub fn float(&self, name: &str) -> Option<f32> {
        self.get_by_name(name).and_then(Value::as_float)
    }

    pub fn schema(&self) -> impl Iterator<Item = PropertyDesc> + '_ {
        self.names
            .iter()
            .zip(&self.values)
            .map(|(name, value)| PropertyDesc {
                name: name.clone(),
                kind: value.kind(),
            })
    }

    /// Same names, order and kinds.
    pub fn matches_schema(&self, other: &PropertyBag) -> bool {
        self.len() == other.len() && self.schema().eq(other.schema())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names.iter().map(|n| n.as_ref()).zip(&self.values)
    }
}
