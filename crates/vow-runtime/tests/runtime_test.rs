//! Integration tests for the Runtime API

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use vow_runtime::{Outcome, Runtime, State, StepFactory, Unhandled, UsageError};

#[derive(Debug, Clone, PartialEq)]
enum Item {
    Num(i32),
    Text(String),
}

#[test]
fn test_merge_resolves_in_input_order() {
    let rt = Runtime::<Item, String>::new().unwrap();
    let (d1, p1) = rt.deferred();
    let (d2, p2) = rt.deferred();
    let merged = rt.merge(&[p1, p2]).unwrap();
    merged.retain().unwrap();

    // Settle out of order; results still follow input order.
    d2.resolve(Item::Text("Success".into())).unwrap();
    d1.resolve(Item::Num(1)).unwrap();
    rt.handle_completes().unwrap();

    assert_eq!(merged.state().unwrap(), State::Resolved);
    match merged.outcome().unwrap() {
        Some(Outcome::ResolvedMany(values)) => {
            assert_eq!(
                values,
                vec![Item::Num(1), Item::Text("Success".into())]
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    merged.release().unwrap();
}

#[test]
fn test_merge_adopts_first_rejection() {
    let rt = Runtime::<Item, String>::new().unwrap();
    let (_d1, p1) = rt.deferred();
    let (d2, p2) = rt.deferred();
    let merged = rt.merge(&[p1, p2]).unwrap();
    merged.retain().unwrap();

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    merged
        .on_settled(move |outcome| {
            *sink.lock() = Some(outcome.clone());
        })
        .unwrap();

    d2.reject("Error!".into()).unwrap();
    rt.handle_completes().unwrap();

    assert_eq!(merged.state().unwrap(), State::Rejected);
    match seen.lock().take() {
        Some(Outcome::Rejected(reason)) => assert_eq!(reason, "Error!"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    merged.release().unwrap();
}

#[test]
fn test_merge_progress_climbs_in_eighths() {
    let rt = Runtime::<i32, String>::new().unwrap();
    let pairs: Vec<_> = (0..4).map(|_| rt.deferred()).collect();
    let promises: Vec<_> = pairs.iter().map(|(_, p)| p.clone()).collect();
    let merged = rt.merge(&promises).unwrap();

    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = values.clone();
    merged
        .on_progress(move |v| sink.lock().push(v))
        .unwrap();
    rt.handle_completes_and_progress().unwrap();

    for (i, (deferred, _)) in pairs.iter().enumerate() {
        deferred.report_progress(0.5).unwrap();
        rt.handle_completes_and_progress().unwrap();
        deferred.resolve(i as i32).unwrap();
        rt.handle_completes_and_progress().unwrap();
    }

    assert_eq!(
        *values.lock(),
        vec![0.0, 0.125, 0.25, 0.375, 0.5, 0.625, 0.75, 0.875, 1.0]
    );
}

#[test]
fn test_concurrent_try_resolve_single_winner() {
    let rt = Runtime::<usize, String>::new().unwrap();
    let (deferred, promise) = rt.deferred();

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    promise
        .on_settled(move |outcome| {
            if let Outcome::Resolved(v) = outcome {
                sink.lock().push(*v);
            }
        })
        .unwrap();

    let wins = Arc::new(AtomicUsize::new(0));
    let winner = Arc::new(AtomicUsize::new(usize::MAX));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let deferred = deferred.clone();
            let wins = wins.clone();
            let winner = winner.clone();
            thread::spawn(move || {
                if deferred.try_resolve(i).unwrap() {
                    wins.fetch_add(1, Ordering::SeqCst);
                    winner.store(i, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    rt.handle_completes().unwrap();

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert_eq!(*delivered.lock(), vec![winner.load(Ordering::SeqCst)]);
}

#[test]
fn test_unobserved_rejection_is_reported_at_drain() {
    let rt = Runtime::<i32, String>::new().unwrap();
    let (deferred, _promise) = rt.deferred();
    deferred.reject("boom".into()).unwrap();

    let report = rt.handle_completes().unwrap_err();
    assert_eq!(report.entries.len(), 1);
    assert!(matches!(&report.entries[0], Unhandled::Rejection(r) if r == "boom"));
    assert_eq!(report.to_string(), "1 unhandled promise failure(s)");

    // The report drains the backlog; the next drain is clean.
    rt.handle_completes().unwrap();
}

#[test]
fn test_settled_promises_recycle_through_the_pool() {
    let rt = Runtime::<i32, String>::new().unwrap();
    let (deferred, promise) = rt.deferred();
    promise.on_settled(|_| {}).unwrap();
    deferred.resolve(7).unwrap();
    rt.handle_completes().unwrap();
    assert_eq!(rt.live_objects(), 0);

    let (_d2, _p2) = rt.deferred();
    assert_eq!(rt.live_objects(), 1);
}

#[test]
fn test_sequence_runs_factories_after_previous_resolves() {
    let rt = Runtime::<i32, String>::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let steps: Vec<StepFactory<i32, String>> = (0..3)
        .map(|i| {
            let rt = rt.clone();
            let order = order.clone();
            Box::new(move || {
                order.lock().push(i);
                rt.resolved(i * 10)
            }) as StepFactory<i32, String>
        })
        .collect();

    let seq = rt.sequence(steps).unwrap();
    seq.retain().unwrap();
    rt.handle_completes().unwrap();

    assert_eq!(*order.lock(), vec![0, 1, 2]);
    assert_eq!(seq.state().unwrap(), State::Resolved);
    assert_eq!(seq.outcome().unwrap(), Some(Outcome::Resolved(20)));
    seq.release().unwrap();
}

#[test]
fn test_sequence_waits_for_deferred_steps() {
    let rt = Runtime::<i32, String>::new().unwrap();
    let slot = Arc::new(Mutex::new(None));

    let first = {
        let rt = rt.clone();
        let slot = slot.clone();
        Box::new(move || {
            let (d, p) = rt.deferred();
            *slot.lock() = Some(d);
            p
        }) as StepFactory<i32, String>
    };
    let second = {
        let rt = rt.clone();
        Box::new(move || rt.resolved(2)) as StepFactory<i32, String>
    };

    let seq = rt.sequence(vec![first, second]).unwrap();
    seq.retain().unwrap();
    rt.handle_completes().unwrap();
    assert_eq!(seq.state().unwrap(), State::Pending);

    slot.lock().take().unwrap().resolve(1).unwrap();
    rt.handle_completes().unwrap();
    assert_eq!(seq.outcome().unwrap(), Some(Outcome::Resolved(2)));
    seq.release().unwrap();
}

#[test]
fn test_combinators_reject_promises_from_another_runtime() {
    let rt_a = Runtime::<i32, String>::new().unwrap();
    let rt_b = Runtime::<i32, String>::new().unwrap();
    let (deferred, foreign) = rt_b.deferred();
    assert!(format!("{foreign:?}").starts_with("Promise"));
    assert!(format!("{deferred:?}").starts_with("Deferred"));

    assert_eq!(rt_a.all(&[foreign]).unwrap_err(), UsageError::StaleHandle);
}

#[test]
fn test_cancelation_propagates_through_chain() {
    let rt = Runtime::<i32, String>::new().unwrap();
    let (deferred, promise) = rt.deferred();
    let chained = promise.chain().unwrap();
    chained.retain().unwrap();

    deferred.cancel("stop".into()).unwrap();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    chained
        .on_settled(move |outcome| {
            *sink.lock() = Some(outcome.clone());
        })
        .unwrap();
    rt.handle_completes().unwrap();

    assert_eq!(chained.state().unwrap(), State::Canceled);
    assert_eq!(seen.lock().take(), Some(Outcome::Canceled("stop".into())));
    chained.release().unwrap();
}

#[test]
fn test_clear_pools_releases_recycled_slots() {
    let rt = Runtime::<i32, String>::new().unwrap();
    for i in 0..4 {
        let (deferred, promise) = rt.deferred();
        promise.on_settled(|_| {}).unwrap();
        deferred.resolve(i).unwrap();
    }
    rt.handle_completes().unwrap();
    assert_eq!(rt.live_objects(), 0);

    rt.clear_pools();
    let (_d, _p) = rt.deferred();
    assert_eq!(rt.live_objects(), 1);
}
