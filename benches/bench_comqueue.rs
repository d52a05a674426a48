//! Slot-queue throughput benchmarks

use std::sync::Arc;
use std::thread;

use criterion::{ criterion_group, criterion_main, BenchmarkId, Criterion, Throughput };

use weft::{ SlotQueue, WeftError };

fn bench_uncontended_cycle(c: &mut Criterion) {
    let queue: SlotQueue<u64> = SlotQueue::new(16);
    c.bench_function("reserve_validate_read_empty", |b| {
        b.iter(|| {
            let slot = queue.reserve().unwrap();
            *queue.payload(slot) = 1;
            queue.validate(slot).unwrap();
            let r = queue.read().unwrap();
            queue.empty(r).unwrap();
        });
    });
}

fn bench_producer_fanin(c: &mut Criterion) {
    let mut group = c.benchmark_group("producer_fanin");
    for producers in [1usize, 2, 4] {
        const PER_PRODUCER: u64 = 4096;
        group.throughput(Throughput::Elements(producers as u64 * PER_PRODUCER));
        group.bench_with_input(
            BenchmarkId::from_parameter(producers),
            &producers,
            |b, &producers| {
                b.iter(|| {
                    let queue: Arc<SlotQueue<u64>> = Arc::new(SlotQueue::new(64));
                    let handles: Vec<_> = (0..producers)
                        .map(|p| {
                            let queue = Arc::clone(&queue);
                            thread::spawn(move || {
                                for k in 0..PER_PRODUCER {
                                    loop {
                                        match queue.reserve() {
                                            Ok(slot) => {
                                                *queue.payload(slot) = p as u64 * PER_PRODUCER + k;
                                                queue.validate(slot).unwrap();
                                                break;
                                            }
                                            Err(WeftError::QueueContended) => {
                                                std::hint::spin_loop()
                                            }
                                            Err(e) => panic!("reserve: {e}"),
                                        }
                                    }
                                }
                            })
                        })
                        .collect();

                    let total = producers as u64 * PER_PRODUCER;
                    let mut received = 0;
                    while received < total {
                        match queue.read() {
                            Ok(slot) => {
                                queue.empty(slot).unwrap();
                                received += 1;
                            }
                            Err(WeftError::QueueContended) => std::hint::spin_loop(),
                            Err(e) => panic!("read: {e}"),
                        }
                    }
                    for h in handles {
                        h.join().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_uncontended_cycle, bench_producer_fanin);
criterion_main!(benches);
