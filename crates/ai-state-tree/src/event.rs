use std::borrow::Cow;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ai_core::{PropertyBag, Tag};
use tracing::warn;

/// Default capacity of an [`EventQueue`].
pub const MAX_ACTIVE_EVENTS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    pub type_name: Cow<'static, str>,
    pub data: PropertyBag,
}

impl EventPayload {
    pub fn new(type_name: impl Into<Cow<'static, str>>, data: PropertyBag) -> Self {
        Self {
            type_name: type_name.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub tag: Tag,
    pub payload: Option<EventPayload>,
    pub origin: Option<Cow<'static, str>>,
}

impl Event {
    pub fn new(tag: impl Into<Tag>) -> Self {
        Self {
            tag: tag.into(),
            payload: None,
            origin: None,
        }
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<Cow<'static, str>>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Content hash, used to key delayed transitions per event.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.tag.hash(&mut hasher);
        self.origin.hash(&mut hasher);
        if let Some(payload) = &self.payload {
            payload.type_name.hash(&mut hasher);
            for (name, value) in payload.data.iter() {
                name.hash(&mut hasher);
                value.hash_into(&mut hasher);
            }
        }
        hasher.finish()
    }
}

pub type SharedEvent = Arc<Event>;

/// Requirements an event has to meet to trigger a transition or allow entering a state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDesc {
    pub tag: Option<Tag>,
    pub payload_type: Option<Cow<'static, str>>,
}

impl EventDesc {
    pub fn tag(tag: impl Into<Tag>) -> Self {
        Self {
            tag: Some(tag.into()),
            payload_type: None,
        }
    }

    pub fn with_payload_type(mut self, type_name: impl Into<Cow<'static, str>>) -> Self {
        self.payload_type = Some(type_name.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.tag.is_some() || self.payload_type.is_some()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(tag) = &self.tag {
            if !event.tag.matches(tag) {
                return false;
            }
        }
        match &self.payload_type {
            Some(type_name) => event
                .payload
                .as_ref()
                .is_some_and(|payload| payload.type_name == *type_name),
            None => true,
        }
    }
}

/// Events sent during a tick, visible to transitions and selection until cleared.
#[derive(Debug, Clone)]
pub struct EventQueue {
    events: Vec<SharedEvent>,
    capacity: usize,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::with_capacity(MAX_ACTIVE_EVENTS)
    }
}

impl EventQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            capacity,
        }
    }

    /// Returns false if the queue is full and the event was dropped.
    pub fn send(&mut self, event: Event) -> bool {
        if self.events.len() >= self.capacity {
            warn!(tag = %event.tag, capacity = self.capacity, "event queue full, dropping event");
            return false;
        }
        self.events.push(Arc::new(event));
        true
    }

    /// Removes `event` by identity. Returns false if it was already consumed.
    pub fn consume(&mut self, event: &SharedEvent) -> bool {
        match self.events.iter().position(|e| Arc::ptr_eq(e, event)) {
            Some(index) => {
                self.events.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedEvent> {
        self.events.iter()
    }

    pub fn matching<'a>(&'a self, desc: &'a EventDesc) -> impl Iterator<Item = &'a SharedEvent> + 'a {
        self.events.iter().filter(move |event| desc.matches(event))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
