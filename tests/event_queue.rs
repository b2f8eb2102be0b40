use std::sync::Arc;
use std::time::Duration;

use fallwatch::event::DecisionSnapshot;
use fallwatch::{EventId, EventQueue, FallEvent, PushOutcome, SealReason, SealedEvent};

fn sealed(seq: u64) -> SealedEvent {
    let start_ts = 1_700_000_000_000 + seq * 60_000;
    SealedEvent {
        event: FallEvent {
            event_id: EventId::new("cam01", seq, start_ts),
            subject_id: Default::default(),
            start_ts,
            end_ts: Some(start_ts + 5_000),
            peak_severity: 0.9,
            frame_refs: vec![],
            clip_ref: None,
        },
        camera_id: "cam01".into(),
        sealed_by: SealReason::Recovered,
        frames: vec![],
        frames_truncated: 0,
        decision: DecisionSnapshot {
            abnormality_threshold: 0.6,
            recovery_threshold: 0.4,
            suspected_dwell_ms: 500,
            recovery_dwell_ms: 1_000,
            peak_body: None,
        },
    }
}

#[test]
fn single_slot_queue_keeps_newest_and_counts_drop() {
    let queue = EventQueue::new(1);
    let first = sealed(1);
    let second = sealed(2);
    let second_id = second.id().clone();

    assert!(matches!(queue.push(first), PushOutcome::Queued));
    match queue.push(second) {
        PushOutcome::QueuedDroppedOldest(dropped) => {
            assert_eq!(dropped.id(), &EventId::new("cam01", 1, 1_700_000_060_000))
        }
        other => panic!("expected a drop, got {:?}", other),
    }

    let stats = queue.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.enqueued, 2);
    assert_eq!(stats.depth, 1);
    assert_eq!(queue.try_pop().map(|e| e.id().clone()), Some(second_id));
    assert!(queue.is_empty());
}

#[test]
fn consumer_drains_everything_pushed_before_close() {
    let queue = Arc::new(EventQueue::new(8));
    let consumer_queue = queue.clone();
    let consumer = std::thread::spawn(move || {
        let mut seen = Vec::new();
        while !consumer_queue.is_closed() || !consumer_queue.is_empty() {
            if let Some(event) = consumer_queue.pop_timeout(Duration::from_millis(50)) {
                seen.push(event.event.start_ts);
            }
        }
        seen
    });

    for seq in 1..=5 {
        queue.push(sealed(seq));
        std::thread::sleep(Duration::from_millis(5));
    }
    queue.close();
    assert!(matches!(queue.push(sealed(6)), PushOutcome::Closed(_)));

    let seen = consumer.join().expect("consumer thread");
    let expected: Vec<u64> = (1..=5).map(|seq| 1_700_000_000_000 + seq * 60_000).collect();
    assert_eq!(seen, expected);
    assert_eq!(queue.stats().rejected_after_close, 1);
}

#[test]
fn drain_remaining_empties_the_queue() {
    let queue = EventQueue::new(4);
    for seq in 1..=3 {
        queue.push(sealed(seq));
    }
    queue.close();
    let rest = queue.drain_remaining();
    assert_eq!(rest.len(), 3);
    assert!(queue.pop_timeout(Duration::from_millis(1)).is_none());
}
