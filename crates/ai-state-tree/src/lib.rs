//! Hierarchical state tree runtime.
//!
//! A [`StateTree`] is an immutable, flattened tree of states, nodes, transitions and copy
//! batches, usually produced by [`StateTreeBuilder`]. An [`ExecutionContext`] owns the runtime
//! data of one agent running a tree: it selects the active path of states (possibly spanning
//! linked subtrees and other trees), runs their tasks, evaluators and global tasks, and resolves
//! transitions each tick.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod bindings;
pub mod builder;
pub mod conditions;
pub mod config;
pub mod considerations;
pub mod context;
pub mod data;
pub mod error;
pub mod event;
pub mod expression;
pub mod frame;
mod lifecycle;
pub mod node;
pub mod parallel;
mod selection;
pub mod storage;
mod transitions;
pub mod tree;
pub mod types;

pub use bindings::{BatchIndex, CopyMode, PropertyBindings, PropertyCopy};
pub use builder::{
    Binding, BindingSource, FunctionSpec, NodeSpec, StateSpec, StateTreeBuilder, TargetSpec,
    TransitionSpec,
};
pub use conditions::{CompareBool, CompareFloat, CompareInt, Comparison, ConstantBool};
pub use config::ExecutionConfig;
pub use considerations::{ConstantConsideration, FloatInputConsideration};
pub use context::{as_any, ExecutionContext, ExternalDataProvider};
pub use data::DataView;
pub use error::{Result, StateTreeError};
pub use event::{Event, EventDesc, EventPayload, EventQueue, SharedEvent, MAX_ACTIVE_EVENTS};
pub use expression::ExpressionTerm;
pub use frame::{ExecutionFrame, FrameId};
pub use node::{
    Condition, Consideration, ContextObject, Evaluator, NodeContext, PropertyFunction, Task,
    TransitionInfo, TransitionRequest,
};
pub use parallel::RunParallelTreeTask;
pub use storage::{InstanceData, InstanceStorage};
pub use tree::{
    CompactState, CompactTransition, DataDesc, Node, NodeKind, StateKind, StateTree, TaskConfig,
    TransitionDelay, TreeId,
};
pub use types::{
    ActiveStates, ChangeType, ConditionEvaluationMode, DataHandle, IndexRange, NodeIndex, Operand,
    SelectionBehavior, SelectionFallback, StateHandle, TransitionPriority, TransitionTarget,
    TransitionTrigger, UpdatePhase, MAX_ACTIVE_STATES, MAX_EXECUTION_FRAMES,
};

pub use ai_core::{PropertyBag, RunStatus, Tag, Value};
