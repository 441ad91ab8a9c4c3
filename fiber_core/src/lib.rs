/*
 *   Copyright (c) 2025 R3BL LLC
 *   All rights reserved.
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! # `fiber_core`
//!
//! A cooperative, single-threaded lightweight-thread (promise) scheduler core.
//!
//! At its heart is a [`Deferred`](promise::Deferred)/[`Resolver`](promise::Resolver)
//! pair: a value that may not be available yet, and the single handle allowed to
//! settle it. A small combinator algebra ([`combinators`]) builds new deferreds out
//! of existing ones - chaining (`bind`/`map`/`catch`/`try_bind`/`finalize`), racing
//! (`choose`/`pick`/`nchoose`/`npick`/`nchoose_split`), and waiting for several at
//! once (`join`) - without ever blocking the thread they run on. A
//! [`Context`](promise::Context) carries dynamically scoped key/value bindings
//! through a chain of combinators, snapshotted at registration time so a resumed
//! callback sees the bindings active where it was *registered*. A pluggable
//! [`Reactor`](reactor::Reactor) supplies I/O readiness and timer events to the
//! [`Driver`](driver::Driver)'s main loop, which is what actually runs all of this:
//! drain paused continuations, poll the reactor, drain anything scheduled via
//! [`Driver::wakeup_later`](driver::Driver::wakeup_later), repeat until the root
//! deferred settles.
//!
//! ## A minimal run
//!
//! ```
//! use fiber_core::combinators::map;
//! use fiber_core::config::SchedulerConfig;
//! use fiber_core::driver::Driver;
//! use fiber_core::promise::{Deferred, wait};
//! use fiber_core::reactor::fallback::FallbackReactor;
//!
//! let config = SchedulerConfig::default();
//! let reactor = FallbackReactor::new().expect("reactor init");
//! let mut driver = Driver::new(config.clone(), reactor);
//!
//! let (input, resolver) = wait::<i32, ()>(&config);
//! let doubled = map(&config, &input, |v| v * 2);
//! resolver.resolve(21).unwrap();
//!
//! let outcome = driver.run(&doubled).unwrap();
//! assert!(matches!(*outcome, fiber_core::promise::Outcome::Resolved(42)));
//! ```
//!
//! ## Non-goals
//!
//! This crate schedules and composes deferred values; it does not provide an async
//! I/O abstraction of its own (bring your own, registered against [`Reactor`]), nor
//! does it spawn OS threads for user work - [`reactor::native::NativeReactor`]'s
//! worker thread exists solely to keep one blocking syscall off the caller's thread,
//! not to run arbitrary callbacks concurrently. Everything in [`promise`] and
//! [`combinators`] runs on whatever single thread calls into them.

#![cfg_attr(not(test), deny(clippy::unwrap_in_result))]

pub mod combinators;
pub mod config;
pub mod driver;
pub mod error;
mod intrusive;
pub mod logging;
pub mod promise;
pub mod reactor;

pub use config::SchedulerConfig;
pub use driver::Driver;
pub use error::{CoreError, CoreResult, ReactorError, ReactorResult};
