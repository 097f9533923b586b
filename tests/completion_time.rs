use finbench_driver::{
    CompletionTimeService, CoordinationError, FailureCell, FailureKind, ProgressKind,
    MAX_TIME_MS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn service() -> CompletionTimeService {
    CompletionTimeService::with_poll_interval(Duration::from_millis(1))
}

#[test]
fn watermark_is_unknown_until_every_writer_reports() {
    let service = service();
    let a = service.register_writer().unwrap();
    let b = service.register_writer().unwrap();
    assert_eq!(service.watermark(), None);

    service.submit_initiated(&a, 10).unwrap();
    service.submit_completed(&a, 10).unwrap();
    assert_eq!(service.watermark(), None);
    assert_eq!(service.snapshot().lagging_writer, Some(b.id()));

    service.submit_initiated(&b, 4).unwrap();
    service.submit_completed(&b, 4).unwrap();
    assert_eq!(service.watermark(), Some(4));
}

#[test]
fn watermark_never_decreases() {
    let service = service();
    let a = service.register_writer().unwrap();
    let b = service.register_writer().unwrap();
    service.seed_all(9).unwrap();
    assert_eq!(service.watermark(), Some(9));

    let mut observed = Vec::new();
    for t in [10, 12, 15, 20] {
        service.submit_initiated(&a, t).unwrap();
        service.submit_completed(&a, t).unwrap();
        observed.push(service.watermark().unwrap());
        service.submit_initiated(&b, t + 1).unwrap();
        service.submit_completed(&b, t + 1).unwrap();
        observed.push(service.watermark().unwrap());
    }
    // Retiring the lagging writer can only raise the watermark.
    service.retire(&a).unwrap();
    observed.push(service.watermark().unwrap());

    assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(*observed.last().unwrap(), 21);
}

#[test]
fn out_of_order_submissions_are_rejected() {
    let service = service();
    let writer = service.register_writer().unwrap();
    service.submit_initiated(&writer, 50).unwrap();
    let err = service.submit_initiated(&writer, 40).unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::OutOfOrder {
            kind: ProgressKind::Initiated,
            previous: 50,
            submitted: 40,
            ..
        }
    ));

    let err = service.submit_completed(&writer, 60).unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::CompletedBeyondInitiated { completed: 60, .. }
    ));

    service.submit_completed(&writer, 50).unwrap();
    let err = service.submit_completed(&writer, 45).unwrap_err();
    assert!(matches!(
        err,
        CoordinationError::OutOfOrder {
            kind: ProgressKind::Completed,
            ..
        }
    ));
}

#[test]
fn registration_closes_once_the_watermark_is_known() {
    let service = service();
    let writer = service.register_writer().unwrap();
    service.seed_all(0).unwrap();
    assert_eq!(
        service.register_writer().unwrap_err(),
        CoordinationError::LateRegistration
    );
    service.retire(&writer).unwrap();
    assert_eq!(
        service.submit_initiated(&writer, 1).unwrap_err(),
        CoordinationError::UnknownWriter(writer.id())
    );
}

#[test]
fn waiters_are_released_only_once_the_dependency_completes() {
    let service = Arc::new(service());
    let writer = service.register_writer().unwrap();
    service.seed_all(99).unwrap();
    service.submit_initiated(&writer, 100).unwrap();

    let failure = Arc::new(FailureCell::new());
    let released = Arc::new(AtomicBool::new(false));
    let waiter = {
        let service = service.clone();
        let failure = failure.clone();
        let released = released.clone();
        thread::spawn(move || {
            let reached = service
                .await_watermark(100, Duration::from_secs(5), &failure)
                .unwrap();
            released.store(true, Ordering::SeqCst);
            reached
        })
    };

    thread::sleep(Duration::from_millis(30));
    assert!(!released.load(Ordering::SeqCst));
    service.submit_completed(&writer, 100).unwrap();
    assert!(waiter.join().unwrap());
    assert!(service.watermark().unwrap() >= 100);
}

#[test]
fn await_times_out_without_progress() {
    let service = service();
    let writer = service.register_writer().unwrap();
    service.seed_all(5).unwrap();
    let started = Instant::now();
    let reached = service
        .await_watermark(6, Duration::from_millis(20), &FailureCell::new())
        .unwrap();
    assert!(!reached);
    assert!(started.elapsed() >= Duration::from_millis(20));
    service.retire(&writer).unwrap();
}

#[test]
fn failure_flag_aborts_waiters() {
    let service = Arc::new(service());
    let _writer = service.register_writer().unwrap();
    service.seed_all(0).unwrap();
    let failure = Arc::new(FailureCell::new());
    let waiter = {
        let service = service.clone();
        let failure = failure.clone();
        thread::spawn(move || service.await_watermark(1_000, Duration::from_secs(10), &failure))
    };
    thread::sleep(Duration::from_millis(10));
    failure.report(FailureKind::Resource, "test", "connection lost");
    assert_eq!(
        waiter.join().unwrap(),
        Err(CoordinationError::Aborted { target: 1_000 })
    );
    assert!(!failure.report(FailureKind::Coordination, "test", "late report"));
    assert_eq!(failure.report_count(), 2);
    assert_eq!(failure.first().unwrap().message, "connection lost");
}

#[test]
fn no_writer_seed_pins_the_watermark_at_maximum() {
    let service = service();
    assert!(service.seed_if_no_writers().unwrap());
    assert_eq!(service.watermark(), Some(MAX_TIME_MS));
    assert!(service
        .await_watermark(u64::MAX - 10, Duration::ZERO, &FailureCell::new())
        .unwrap());
    assert!(service.snapshot().seeded);

    let registered = CompletionTimeService::new();
    registered.register_writer().unwrap();
    assert!(!registered.seed_if_no_writers().unwrap());
}

#[test]
fn idle_writers_follow_the_frontier() {
    let service = service();
    let busy = service.register_writer().unwrap();
    let idle = service.register_writer().unwrap();
    service.seed_all(0).unwrap();

    service.submit_initiated(&busy, 30).unwrap();
    service.certify_up_to(&busy, 29).unwrap();
    assert_eq!(service.watermark(), Some(0));

    service.advance_idle(&idle, 29).unwrap();
    assert_eq!(service.watermark(), Some(29));
    assert_eq!(service.snapshot().live_writers, 2);

    service.shutdown();
    assert!(service.is_shut_down());
    assert_eq!(
        service
            .await_watermark(1, Duration::ZERO, &FailureCell::new())
            .unwrap_err(),
        CoordinationError::ShutDown
    );
}
