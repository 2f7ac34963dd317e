use std::borrow::Cow;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Hierarchical, dot-separated name used for events, state tags and override lookup.
///
/// `"enemy.spotted"` matches `"enemy"` and `"enemy.spotted"`, but not `"enemy.spot"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tag(Cow<'static, str>);

impl Tag {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `self` equals `parent` or is nested below it.
    pub fn matches(&self, parent: &Tag) -> bool {
        let (own, parent) = (self.as_str(), parent.as_str());
        if parent.is_empty() {
            return false;
        }
        match own.strip_prefix(parent) {
            Some("") => true,
            Some(rest) => rest.starts_with('.'),
            None => false,
        }
    }

    pub fn parent(&self) -> Option<Tag> {
        let (head, _) = self.as_str().rsplit_once('.')?;
        Some(Tag::new(head.to_owned()))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for Tag {
    fn from(value: &'static str) -> Self {
        Tag::from_static(value)
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Tag::new(value)
    }
}
