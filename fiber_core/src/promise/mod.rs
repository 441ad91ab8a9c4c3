// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The deferred-value graph: pending/settled nodes, waiter registration, union-find
//! forwarding, and the dynamically scoped context combinators run under.

mod context;
mod deferred;
mod node;
mod waiter;

pub use context::{Context, Key, capture_current, with_context};
pub use deferred::{Deferred, PromiseState, Resolver, task, wait};
pub use node::{CancelHandle, Outcome};
pub(crate) use node::NodeRef;
pub(crate) use waiter::WaiterHandle;
