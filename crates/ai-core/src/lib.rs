//! Deterministic, engine-agnostic primitives shared by the state tree runtime.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod bag;
pub mod rng;
pub mod status;
pub mod tag;
pub mod value;

pub use bag::{PropKey, PropertyBag, PropertyDesc};
pub use rng::{derive_seed, mix64, DeterministicRng, SplitMix64};
pub use status::RunStatus;
pub use tag::Tag;
pub use value::{FromValue, Value, ValueKind};
