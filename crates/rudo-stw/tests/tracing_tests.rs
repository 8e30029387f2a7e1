//! Integration tests for the tracing feature.
//!
//! A capturing layer records span names and event messages emitted on the
//! test thread while the collector works.

#![cfg(feature = "tracing")]

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rudo_stw::{CollectorConfig, CollectorState, NoHooks, SuspendKind, ThreadRoots, Tracer};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

struct NullTracer;

impl Tracer for NullTracer {
    fn mark_roots(&self, _roots: &ThreadRoots) {}
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<String>>>);

impl Captured {
    fn contains(&self, name: &str) -> bool {
        self.0.lock().iter().any(|entry| entry == name)
    }

    fn count(&self, name: &str) -> usize {
        self.0.lock().iter().filter(|entry| *entry == name).count()
    }
}

struct MessageVisitor(Option<String>);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for Captured {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        self.0.lock().push(attrs.metadata().name().to_owned());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(None);
        event.record(&mut visitor);
        if let Some(message) = visitor.0 {
            self.0.lock().push(message);
        }
    }
}

fn with_capture(f: impl FnOnce()) -> Captured {
    let captured = Captured::default();
    let subscriber = Registry::default().with(captured.clone());
    tracing::subscriber::with_default(subscriber, f);
    captured
}

fn collector(markers: usize) -> Arc<CollectorState> {
    let config = CollectorConfig::default()
        .with_suspend_kind(SuspendKind::Cooperative)
        .with_markers(markers)
        .with_processors(4);
    CollectorState::new(config, Arc::new(NullTracer), Arc::new(NoHooks)).unwrap()
}

#[test]
fn test_collection_emits_round_span_and_events() {
    let collector = collector(1);
    let captured = with_capture(|| {
        for _ in 0..3 {
            collector.collect().unwrap();
        }
    });
    assert_eq!(captured.count("stop_world"), 3);
    assert_eq!(captured.count("threads_stopped"), 3);
    assert_eq!(captured.count("world_restarted"), 3);
    assert!(!captured.contains("mark_generation"));
}

#[test]
fn test_parallel_marking_emits_generation_spans() {
    let collector = collector(3);
    let captured = with_capture(|| {
        collector.collect().unwrap();
        collector.collect().unwrap();
    });
    assert!(captured.contains("markers_started"));
    assert_eq!(captured.count("mark_generation"), 2);
}

#[test]
fn test_registration_and_fork_hooks_are_logged() {
    let collector = collector(1);
    let captured = with_capture(|| {
        let mutator = collector.register_current_thread().unwrap();
        collector.fork_prepare();
        collector.fork_parent();
        drop(mutator);
    });
    assert!(captured.contains("thread_registered"));
    assert!(captured.contains("thread_exit"));
    assert_eq!(captured.count("fork_hook"), 2);
}
