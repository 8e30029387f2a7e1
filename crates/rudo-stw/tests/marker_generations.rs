//! Tests for parallel mark coordination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rudo_stw::{
    CollectorConfig, CollectorState, MarkerId, NoHooks, SuspendKind, ThreadRoots, Tracer,
};

#[derive(Default)]
struct RecordingTracer {
    units: Mutex<HashMap<usize, Vec<u64>>>,
    helper_names: Mutex<Vec<String>>,
    #[cfg(target_os = "linux")]
    masks: Mutex<Vec<(bool, bool)>>,
    #[cfg(target_os = "linux")]
    suspend_signal: Option<i32>,
}

impl Tracer for RecordingTracer {
    fn mark_roots(&self, _roots: &ThreadRoots) {}

    fn mark_unit(&self, marker: MarkerId, generation: u64) {
        self.units
            .lock()
            .entry(marker.0)
            .or_default()
            .push(generation);
        if marker.is_helper() {
            if let Some(name) = thread::current().name() {
                self.helper_names.lock().push(name.to_owned());
            }
            #[cfg(target_os = "linux")]
            if let (Some(suspend), Ok(mask)) =
                (self.suspend_signal, sys_thread::current_signal_mask())
            {
                self.masks
                    .lock()
                    .push((mask.contains(libc::SIGINT), mask.contains(suspend)));
            }
        }
        thread::sleep(Duration::from_micros(100));
    }
}

fn parallel_config(kind: SuspendKind) -> CollectorConfig {
    CollectorConfig::default()
        .with_suspend_kind(kind)
        .with_markers(4)
        .with_processors(4)
}

#[test]
fn test_generations_increase_per_marker() {
    let tracer = Arc::new(RecordingTracer::default());
    let collector = CollectorState::new(
        parallel_config(SuspendKind::Cooperative),
        tracer.clone(),
        Arc::new(NoHooks),
    )
    .unwrap();

    for _ in 0..20 {
        let metrics = collector.collect().unwrap();
        assert!((1..=4).contains(&metrics.markers));
    }
    assert!(collector.is_parallel_marking_active());
    assert_eq!(collector.helper_count(), 3);
    assert_eq!(collector.mark_generation(), 20);

    let units = tracer.units.lock();
    let initiator = &units[&MarkerId::INITIATOR.0];
    assert_eq!(initiator, &(1..=20).collect::<Vec<u64>>());
    for (marker, generations) in units.iter() {
        assert!(*marker <= 3);
        assert!(
            generations.windows(2).all(|pair| pair[0] < pair[1]),
            "marker {marker} saw {generations:?}"
        );
        assert!(generations.iter().all(|g| (1..=20).contains(g)));
    }

    let names = tracer.helper_names.lock();
    assert!(names.iter().all(|name| name.starts_with("rudo-marker-")));
}

#[cfg(target_os = "linux")]
#[test]
fn test_helpers_block_all_but_suspend_signals() {
    let config = parallel_config(SuspendKind::Signals);
    let suspend = config.signals().unwrap().0;
    let tracer = Arc::new(RecordingTracer {
        suspend_signal: Some(suspend),
        ..RecordingTracer::default()
    });
    let collector = CollectorState::new(config, tracer.clone(), Arc::new(NoHooks)).unwrap();
    collector.start_markers();
    assert_eq!(collector.helper_count(), 3);

    // Helpers only join when they wake in time, so give them a few chances.
    for _ in 0..50 {
        collector.collect().unwrap();
        if !tracer.masks.lock().is_empty() {
            break;
        }
    }
    let masks = tracer.masks.lock();
    assert!(!masks.is_empty());
    for &(blocks_sigint, blocks_suspend) in masks.iter() {
        assert!(blocks_sigint);
        assert!(!blocks_suspend);
    }
}

#[test]
fn test_single_marker_from_environment_is_serial() {
    let config = CollectorConfig::from_lookup(|key| {
        (key == "MARKER_COUNT").then(|| "1".to_owned())
    })
    .unwrap()
    .with_suspend_kind(SuspendKind::Cooperative)
    .with_processors(8);
    assert_eq!(config.helper_count(), 0);

    let tracer = Arc::new(RecordingTracer::default());
    let collector = CollectorState::new(config, tracer.clone(), Arc::new(NoHooks)).unwrap();
    for _ in 0..3 {
        assert_eq!(collector.collect().unwrap().markers, 1);
    }
    assert!(!collector.is_parallel_marking_active());
    assert_eq!(collector.helper_count(), 0);

    let units = tracer.units.lock();
    assert_eq!(units.len(), 1);
    assert_eq!(units[&MarkerId::INITIATOR.0], vec![1, 2, 3]);
}

#[test]
fn test_uniprocessor_marks_serially() {
    let config = CollectorConfig::default()
        .with_suspend_kind(SuspendKind::Cooperative)
        .with_markers(4)
        .with_processors(1);
    let tracer = Arc::new(RecordingTracer::default());
    let collector = CollectorState::new(config, tracer.clone(), Arc::new(NoHooks)).unwrap();
    collector.start_markers();
    assert!(!collector.is_parallel_marking_active());
    assert_eq!(collector.collect().unwrap().markers, 1);
}

#[test]
fn test_collection_waits_for_builders() {
    let collector = CollectorState::new(
        parallel_config(SuspendKind::Cooperative),
        Arc::new(RecordingTracer::default()),
        Arc::new(NoHooks),
    )
    .unwrap();
    collector.start_markers();

    collector.begin_build();
    let done = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let gc = {
        let collector = Arc::clone(&collector);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            tx.send(()).unwrap();
            collector.collect().unwrap();
            done.store(true, Ordering::SeqCst);
        })
    };
    rx.recv().unwrap();
    thread::sleep(Duration::from_millis(30));
    assert!(!done.load(Ordering::SeqCst));

    collector.end_build();
    gc.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(collector.stw_rounds(), 1);
}

#[test]
fn test_builder_from_registered_thread_does_not_stall_stop() {
    let collector = CollectorState::new(
        parallel_config(SuspendKind::Cooperative),
        Arc::new(RecordingTracer::default()),
        Arc::new(NoHooks),
    )
    .unwrap();
    collector.start_markers();

    let (tx, rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let builder = {
        let collector = Arc::clone(&collector);
        thread::spawn(move || {
            let mutator = collector.register_current_thread().unwrap();
            collector.begin_build();
            tx.send(()).unwrap();
            mutator.do_blocking(|| release_rx.recv().unwrap());
            collector.end_build();
            collector.wait_for_reclaim();
        })
    };
    rx.recv().unwrap();

    let world = collector.stop_world();
    assert_eq!(world.threads().len(), 1);
    drop(world);

    release_tx.send(()).unwrap();
    builder.join().unwrap();
}
