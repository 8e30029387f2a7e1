//! Stop-the-world thread suspension and parallel mark coordination.
//!
//! `rudo-stw` is the part of a tracing garbage collector that brings every
//! mutator thread to a halt, hands their stacks and registers to the
//! tracer, runs marking on a pool of helper threads, and lets the world run
//! again. It owns no heap: the tracer and the allocator plug in through
//! [`Tracer`] and [`AllocatorHooks`].
//!
//! # Features
//!
//! - **Two suspension backends**: POSIX signals stop threads wherever they
//!   are; cooperative suspension stops them at [`MutatorHandle::safepoint`].
//! - **Blocking regions**: threads in a syscall count as stopped without
//!   being interrupted ([`MutatorHandle::do_blocking`]).
//! - **Parallel marking**: up to [`MAX_MARKERS`] markers per collection,
//!   synchronized on a mark generation counter.
//! - **Fork safety**: `pthread_atfork` hooks leave a usable collector in the
//!   child.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use rudo_stw::{CollectorConfig, CollectorState, NoHooks, SuspendKind, ThreadRoots, Tracer};
//!
//! struct PrintRoots;
//!
//! impl Tracer for PrintRoots {
//!     fn mark_roots(&self, roots: &ThreadRoots) {
//!         println!("{:?}: {} bytes of stack", roots.id, roots.stack_len());
//!     }
//! }
//!
//! let config = CollectorConfig::default().with_suspend_kind(SuspendKind::Cooperative);
//! let collector = CollectorState::new(config, Arc::new(PrintRoots), Arc::new(NoHooks))?;
//! let mutator = collector.register_current_thread()?;
//!
//! let metrics = collector.collect()?;
//! assert_eq!(metrics.round, 1);
//! drop(mutator);
//! # Ok::<(), rudo_stw::StwError>(())
//! ```
//!
//! # Thread Safety
//!
//! [`CollectorState`] is `Send + Sync` and shared through an `Arc`.
//! [`MutatorHandle`] is `!Send`: it describes the thread that registered.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod atomic;
mod collector;
mod config;
mod context;
mod error;
mod fork;
mod lock;
mod marker;
mod metrics;
pub mod registry;
mod suspend;
pub mod sync;
pub mod tracing;
mod world;

// Re-export public API
pub use collector::{AllocatorHooks, CollectorState, MutatorHandle, NoHooks, Tracer};
pub use config::{CollectorConfig, SuspendKind, DEFAULT_RETRY_INTERVAL, MAX_MARKERS};
pub use context::{capture_context, SavedContext, ThreadRoots, CONTEXT_WORDS};
pub use error::StwError;
pub use fork::install_fork_handlers;
pub use lock::{AllocGuard, AllocationLock, LockStats, SPIN_MAX};
pub use marker::{MarkerId, MARKER_STACK_SIZE};
pub use metrics::{RoundStats, StwMetrics};
pub use world::{StopOutcome, StoppedThread, WorldStopped};

pub use sys_thread::NativeThreadId;
