//! Compiled copy batches that move values between node instances, parameters and events.

use ai_core::{PropertyBag, Value};
use tracing::trace;

use crate::error::{Result, StateTreeError};
use crate::types::{DataHandle, IndexRange, NodeIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchIndex(pub u16);

/// One resolved field copy; the target is the view the batch is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyCopy {
    pub source: DataHandle,
    pub source_field: u16,
    pub target_field: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyBatch {
    pub copies: IndexRange,
    /// Property functions to execute before copying.
    pub functions: IndexRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// Sources are known to be live; a missing source is skipped.
    #[default]
    Unchecked,
    /// Sources may not be instantiated yet; any missing source aborts the whole batch.
    Validated,
}

#[derive(Debug, Clone, Default)]
pub struct PropertyBindings {
    batches: Vec<CopyBatch>,
    copies: Vec<PropertyCopy>,
    functions: Vec<NodeIndex>,
}

/// Source values read for a batch, not yet written.
#[derive(Debug, Clone, Default)]
pub struct GatheredCopies {
    values: Vec<(u16, Value)>,
    complete: bool,
}

impl GatheredCopies {
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Writes the gathered values; false if a source was missing or a kind did not match.
    pub fn apply(self, target: &mut PropertyBag) -> bool {
        let mut ok = self.complete;
        for (field, value) in self.values {
            if !target.set(field, value) {
                trace!(field, "binding target field missing or of another kind");
                ok = false;
            }
        }
        ok
    }
}

impl PropertyBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(
        &mut self,
        copies: impl IntoIterator<Item = PropertyCopy>,
        functions: impl IntoIterator<Item = NodeIndex>,
    ) -> BatchIndex {
        let copies_begin = self.copies.len() as u16;
        self.copies.extend(copies);
        let functions_begin = self.functions.len() as u16;
        self.functions.extend(functions);
        self.batches.push(CopyBatch {
            copies: IndexRange::new(copies_begin, self.copies.len() as u16),
            functions: IndexRange::new(functions_begin, self.functions.len() as u16),
        });
        BatchIndex((self.batches.len() - 1) as u16)
    }

    pub fn batch(&self, batch: BatchIndex) -> Option<&CopyBatch> {
        self.batches.get(batch.0 as usize)
    }

    pub fn copies(&self, batch: BatchIndex) -> &[PropertyCopy] {
        match self.batch(batch) {
            Some(batch) => &self.copies[batch.copies.indices()],
            None => &[],
        }
    }

    pub fn functions(&self, batch: BatchIndex) -> &[NodeIndex] {
        match self.batch(batch) {
            Some(batch) => &self.functions[batch.functions.indices()],
            None => &[],
        }
    }

    pub fn check_batch(&self, batch: BatchIndex) -> Result<()> {
        let copy_batch = self
            .batch(batch)
            .ok_or_else(|| StateTreeError::config(format!("missing copy batch {}", batch.0)))?;
        if copy_batch.copies.end as usize > self.copies.len()
            || copy_batch.functions.end as usize > self.functions.len()
        {
            return Err(StateTreeError::config(format!(
                "copy batch {} out of range",
                batch.0
            )));
        }
        Ok(())
    }

    /// Reads every source of `batch` through `read`.
    pub fn gather(
        &self,
        batch: BatchIndex,
        mode: CopyMode,
        mut read: impl FnMut(DataHandle, u16) -> Option<Value>,
    ) -> GatheredCopies {
        let copies = self.copies(batch);
        let mut gathered = GatheredCopies {
            values: Vec::with_capacity(copies.len()),
            complete: true,
        };
        for copy in copies {
            match read(copy.source, copy.source_field) {
                Some(value) => gathered.values.push((copy.target_field, value)),
                None if mode == CopyMode::Validated => {
                    trace!(source = ?copy.source, "validated copy source unavailable");
                    gathered.values.clear();
                    gathered.complete = false;
                    return gathered;
                }
                None => {
                    trace!(source = ?copy.source, "copy source unavailable, skipped");
                    gathered.complete = false;
                }
            }
        }
        gathered
    }

    /// Copies `batch` into `target`.
    pub fn copy_batch(
        &self,
        batch: BatchIndex,
        mode: CopyMode,
        read: impl FnMut(DataHandle, u16) -> Option<Value>,
        target: &mut PropertyBag,
    ) -> bool {
        self.gather(batch, mode, read).apply(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateHandle;

    fn bindings() -> (PropertyBindings, BatchIndex) {
        let mut bindings = PropertyBindings::new();
        let batch = bindings.push_batch(
            [
                PropertyCopy {
                    source: DataHandle::GlobalParameters,
                    source_field: 0,
                    target_field: 1,
                },
                PropertyCopy {
                    source: DataHandle::StateParameters(StateHandle(2)),
                    source_field: 0,
                    target_field: 0,
                },
            ],
            [],
        );
        (bindings, batch)
    }

    fn read(handle: DataHandle, _field: u16) -> Option<Value> {
        match handle {
            DataHandle::GlobalParameters => Some(Value::Int(7)),
            _ => None,
        }
    }

    #[test]
    fn validated_copy_writes_nothing_when_a_source_is_missing() {
        let (bindings, batch) = bindings();
        let mut target = PropertyBag::new().with("a", 1).with("b", 2);

        assert!(!bindings.copy_batch(batch, CopyMode::Validated, read, &mut target));
        assert_eq!(target.int("b"), Some(2));
    }

    #[test]
    fn unchecked_copy_skips_missing_sources() {
        let (bindings, batch) = bindings();
        let mut target = PropertyBag::new().with("a", 1).with("b", 2);

        assert!(!bindings.copy_batch(batch, CopyMode::Unchecked, read, &mut target));
        assert_eq!(target.int("b"), Some(7));
        assert_eq!(target.int("a"), Some(1));
    }

    #[test]
    fn kind_mismatch_fails_the_copy() {
        let (bindings, batch) = bindings();
        let mut target = PropertyBag::new().with("a", 1).with("b", false);
        let all = |_: DataHandle, _: u16| Some(Value::Int(3));

        assert!(!bindings.copy_batch(batch, CopyMode::Unchecked, all, &mut target));
        assert_eq!(target.int("a"), Some(3));
        assert_eq!(target.bool("b"), Some(false));
    }
}
