//! Slot-queue contention and inter-domain messaging scenarios

mod common;

use std::sync::Arc;
use std::thread;

use weft::domain::{ DomainShared, PolicyDomain };
use weft::transport::{
    MessageBody, PolicyMessage, QueueSide, SendProps, TransportConfig, TransportFabric,
};
use weft::{
    EventKind, Guid, Runtime, RuntimeConfig, SlotQueue, TaskInput, TaskScope, WeftError,
    NULL_GUID,
};

/// Sixteen producers each push 64 messages through an 8-slot ring; a single
/// consumer drains. Nothing lost, nothing duplicated, ring fully recovered.
#[test]
fn slot_queue_contention_drains_exactly() {
    common::init_tracing();
    const PRODUCERS: u64 = 16;
    const PER_PRODUCER: u64 = 64;
    const TOTAL: u64 = PRODUCERS * PER_PRODUCER;

    let queue: Arc<SlotQueue<u64>> = Arc::new(SlotQueue::new(8));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for k in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + k;
                    loop {
                        match queue.reserve() {
                            Ok(slot) => {
                                *queue.payload(slot) = value;
                                queue.validate(slot).unwrap();
                                break;
                            }
                            Err(WeftError::QueueContended) => std::hint::spin_loop(),
                            Err(e) => panic!("reserve: {e}"),
                        }
                    }
                }
            })
        })
        .collect();

    let mut seen = vec![false; TOTAL as usize];
    let mut received = 0u64;
    while received < TOTAL {
        match queue.read() {
            Ok(slot) => {
                let value = *queue.payload(slot) as usize;
                assert!(!seen[value], "message {value} duplicated");
                seen[value] = true;
                queue.empty(slot).unwrap();
                received += 1;
            }
            Err(WeftError::QueueContended) => std::hint::spin_loop(),
            Err(e) => panic!("read: {e}"),
        }
    }
    for p in producers {
        p.join().unwrap();
    }

    assert_eq!(received, TOTAL);
    assert!(seen.iter().all(|&s| s), "message lost");
    assert!(queue.read().is_err(), "queue should be empty");
    assert!(queue.is_drained(), "ring should be fully writeable again");
}

fn two_domains() -> (Arc<DomainShared>, PolicyDomain, PolicyDomain, TransportFabric) {
    common::init_tracing();
    let shared = Arc::new(DomainShared::new());
    let d0 = PolicyDomain::new(0, Arc::clone(&shared));
    let d1 = PolicyDomain::new(1, Arc::clone(&shared));

    let fabric = TransportFabric::new(&[0, 1], &TransportConfig::new(4).unwrap()).unwrap();
    fabric.wire();
    d0.attach_endpoint(fabric.endpoint(0).unwrap().clone(), vec![1]);
    d1.attach_endpoint(fabric.endpoint(1).unwrap().clone(), vec![0]);
    (shared, d0, d1, fabric)
}

/// A satisfaction shipped across domains lands on the shared registry
#[test]
fn remote_event_satisfy_delivers() {
    let (shared, d0, d1, fabric) = two_domains();

    let scope = d0.scope();
    let evt = scope.event_create(EventKind::Sticky).unwrap();

    let msg = PolicyMessage::request(
        0,
        1,
        MessageBody::EventSatisfy {
            event: evt,
            payload: Guid::from_raw(5050),
            slot: 0,
        },
    );
    fabric
        .endpoint(0)
        .unwrap()
        .send(msg, SendProps::default())
        .unwrap();

    let received = fabric.endpoint(1).unwrap().poll().unwrap().expect("message");
    d1.handle_message(&received);

    let evt_obj = shared.registry.resolve_event(evt).unwrap();
    assert_eq!(evt_obj.payload(), Some(Guid::from_raw(5050)));
}

/// A guid query travels as request-expecting-response; the answer comes back
/// on the pre-reserved slot
#[test]
fn guid_query_round_trip() {
    let (_shared, d0, d1, fabric) = two_domains();

    let scope = d0.scope();
    let evt = scope.event_create(EventKind::Sticky).unwrap();

    let req = PolicyMessage::request_expecting_response(
        0,
        1,
        MessageBody::GuidQuery { guid: evt },
    );
    fabric
        .endpoint(0)
        .unwrap()
        .send(req, SendProps::TWOWAY)
        .unwrap();

    let received = fabric.endpoint(1).unwrap().poll().unwrap().expect("query");
    d1.handle_message(&received);

    let answer = fabric.endpoint(0).unwrap().poll().unwrap().expect("answer");
    match answer.body {
        MessageBody::GuidInfo { guid, kind } => {
            assert_eq!(guid, evt);
            assert_eq!(kind, Some(weft::GuidKind::Event as u8));
        }
        ref other => panic!("unexpected body {other:?}"),
    }
}

/// A shutdown arriving over the wire marks the cause as message-triggered
#[test]
fn remote_shutdown_flags_from_msg() {
    let (shared, _d0, d1, fabric) = two_domains();

    let msg = PolicyMessage::request(0, 1, MessageBody::Shutdown { exit_code: 4 });
    fabric
        .endpoint(0)
        .unwrap()
        .send(msg, SendProps::PERSIST)
        .unwrap();

    let received = fabric.endpoint(1).unwrap().poll().unwrap().expect("shutdown");
    d1.handle_message(&received);

    let cause = shared.shutdown.peek().expect("signalled");
    assert_eq!(cause.exit_code, 4);
    assert!(cause.from_msg);
}

/// Hello handshakes from bring-up sit in the peer-class queues until polled
#[test]
fn hello_lands_on_the_expected_side() {
    let (_shared, _d0, _d1, fabric) = two_domains();

    let msg = PolicyMessage::request(0, 1, MessageBody::Hello { location: 0 });
    fabric
        .endpoint(0)
        .unwrap()
        .send(msg, SendProps::default())
        .unwrap();

    // Sender 0 is upstream of endpoint 1
    let ep1 = fabric.endpoint(1).unwrap();
    assert!(!ep1.inbound(QueueSide::Upstream).is_drained());
    assert!(ep1.inbound(QueueSide::Downstream).is_drained());
    let received = ep1.poll().unwrap().expect("hello");
    assert!(matches!(received.body, MessageBody::Hello { location: 0 }));
}

// ---- full runtime with co-located domains ----

fn multi_domain_root(scope: &TaskScope<'_>, _params: &[u64], _inputs: &[TaskInput]) -> Guid {
    scope.shutdown(0);
    NULL_GUID
}

#[test]
fn two_domain_runtime_starts_and_stops() {
    common::init_tracing();
    let config = RuntimeConfig::new()
        .with_workers(2)
        .unwrap()
        .with_domains(3)
        .unwrap();
    let exit = Runtime::run(config, multi_domain_root).unwrap();
    assert_eq!(exit, 0);
}
