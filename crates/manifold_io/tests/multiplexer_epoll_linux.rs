// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end scenarios for the readiness multiplexer: fan-in, deadlines, posted work,
//! cancellation and shutdown safety.

#![cfg(target_os = "linux")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use manifold_io::{
    CompletionScope, ConstBuffer, Deadline, EpollMultiplexer, Error, IoHandle, IoMultiplexer,
    IoOutcome, OperationConnection, Progress, Result,
};

fn drive_until(
    multiplexer: &EpollMultiplexer,
    mut done: impl FnMut() -> bool,
    budget: Duration,
) {
    let started = Instant::now();
    while !done() {
        assert!(
            started.elapsed() < budget,
            "completion loop made no progress within {budget:?}"
        );
        multiplexer
            .run(64, Deadline::steady(Duration::from_millis(100)))
            .unwrap();
    }
}

/// Sixty-four pipes fan into one multiplexer; every receiver observes its own
/// little-endian index exactly once, regardless of write order.
#[test]
fn multiplexed_fan_in() {
    const PIPES: usize = 64;

    let multiplexer = EpollMultiplexer::new().unwrap();

    let mut readers = Vec::with_capacity(PIPES);
    let mut writers = Vec::with_capacity(PIPES);
    for _ in 0..PIPES {
        let (reader, writer) = IoHandle::pipe().unwrap();
        multiplexer.register_handle(&reader.native_handle()).unwrap();
        readers.push(reader);
        writers.push(writer);
    }

    let observed: Arc<Mutex<Vec<(usize, u64)>>> = Arc::new(Mutex::new(Vec::new()));

    // One registered buffer per pending read; the receiver decodes from its own buffer.
    for (index, reader) in readers.iter().enumerate() {
        let buffer = multiplexer.allocate_registered_buffer(8).unwrap();
        let descriptor = buffer.as_buffer();

        let op = OperationConnection::read(reader, vec![descriptor], 0, {
            let observed = Arc::clone(&observed);
            move |result: Result<IoOutcome>| {
                let outcome = result.unwrap();
                assert_eq!(outcome.bytes_transferred(), 8);

                // SAFETY: The operation has completed; nothing else touches this buffer.
                let bytes = unsafe { buffer.as_slice() };
                let value = u64::from_le_bytes(bytes[..8].try_into().unwrap());
                observed.lock().unwrap().push((index, value));
            }
        });
        multiplexer.start_read(op).unwrap();
    }

    assert_eq!(multiplexer.pending_io(), PIPES);

    // Deliver the indexes in reverse order from a writer thread.
    let writer_thread = std::thread::spawn(move || {
        for (index, writer) in writers.iter().enumerate().rev() {
            let payload = (index as u64).to_le_bytes();
            assert_eq!(
                writer.write_at(0, &payload, Deadline::infinite()).unwrap(),
                8
            );
        }
        writers
    });

    drive_until(
        &multiplexer,
        || observed.lock().unwrap().len() == PIPES,
        Duration::from_secs(30),
    );

    let _writers = writer_thread.join().unwrap();

    let mut results = observed.lock().unwrap().clone();
    results.sort_unstable();
    for (position, (index, value)) in results.iter().enumerate() {
        assert_eq!(position, *index);
        assert_eq!(*index as u64, *value);
    }

    assert_eq!(multiplexer.pending_io(), 0);
}

/// A read with only a deadline expires in the promised window.
#[test]
fn deadline_only_expiry() {
    let multiplexer = EpollMultiplexer::new().unwrap();

    let (reader, _writer) = IoHandle::pipe().unwrap();
    multiplexer.register_handle(&reader.native_handle()).unwrap();

    let buffer = multiplexer.allocate_registered_buffer(8).unwrap();
    let delivered: Arc<Mutex<Option<(Duration, Result<IoOutcome>)>>> =
        Arc::new(Mutex::new(None));

    let started = Instant::now();
    let op = OperationConnection::read(&reader, vec![buffer.as_buffer()], 0, {
        let delivered = Arc::clone(&delivered);
        move |result| {
            *delivered.lock().unwrap() = Some((started.elapsed(), result));
        }
    })
    .with_deadline(Deadline::steady(Duration::from_millis(100)));
    multiplexer.start_read(op).unwrap();

    drive_until(
        &multiplexer,
        || delivered.lock().unwrap().is_some(),
        Duration::from_secs(10),
    );

    let (elapsed, result) = delivered.lock().unwrap().take().unwrap();
    assert!(matches!(result, Err(Error::TimedOut)));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(1));
    assert_eq!(multiplexer.pending_io(), 0);
}

/// An absolute (wall clock) deadline expires like a relative one.
#[test]
fn wall_clock_deadline_expiry() {
    let multiplexer = EpollMultiplexer::new().unwrap();

    let (reader, _writer) = IoHandle::pipe().unwrap();
    multiplexer.register_handle(&reader.native_handle()).unwrap();

    let buffer = multiplexer.allocate_registered_buffer(8).unwrap();
    let delivered = Arc::new(Mutex::new(None));

    let op = OperationConnection::read(&reader, vec![buffer.as_buffer()], 0, {
        let delivered = Arc::clone(&delivered);
        move |result| *delivered.lock().unwrap() = Some(result)
    })
    .with_deadline(Deadline::absolute(
        std::time::SystemTime::now() + Duration::from_millis(100),
    ));
    multiplexer.start_read(op).unwrap();

    drive_until(
        &multiplexer,
        || delivered.lock().unwrap().is_some(),
        Duration::from_secs(10),
    );

    assert!(matches!(
        delivered.lock().unwrap().take(),
        Some(Err(Error::TimedOut))
    ));
}

/// Posted callables run in submission order on a single thread, exactly once each.
#[test]
fn posted_work_runs_in_order() {
    let multiplexer = EpollMultiplexer::new().unwrap();
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    for n in 1..=3 {
        let order = Arc::clone(&order);
        multiplexer.post(Box::new(move || order.lock().unwrap().push(n)));
    }

    let executed = multiplexer
        .invoke_posted_items(usize::MAX, Deadline::infinite())
        .unwrap();

    assert_eq!(executed, 3);
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

/// A post from another thread wakes a loop blocked in the kernel.
#[test]
fn post_wakes_a_blocked_loop() {
    let multiplexer = Arc::new(EpollMultiplexer::new().unwrap());
    let executed = Arc::new(AtomicUsize::new(0));

    let poster = std::thread::spawn({
        let multiplexer = Arc::clone(&multiplexer);
        let executed = Arc::clone(&executed);
        move || {
            std::thread::sleep(Duration::from_millis(50));
            multiplexer.post(Box::new(move || {
                executed.fetch_add(1, Ordering::SeqCst);
            }));
        }
    });

    // Block well past the post; the wake must cut the sleep short.
    let started = Instant::now();
    let progress = multiplexer
        .run(64, Deadline::steady(Duration::from_secs(30)))
        .unwrap();

    assert_eq!(progress, Progress::Processed(1));
    assert_eq!(executed.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(10));

    poster.join().unwrap();
}

/// The cancellation race: the receiver observes exactly one of "canceled" or "one byte
/// read", and the multiplexer shuts down cleanly afterwards.
#[test]
fn cancellation_race() {
    let multiplexer = Arc::new(EpollMultiplexer::new().unwrap());

    let (reader, writer) = IoHandle::pipe().unwrap();
    multiplexer.register_handle(&reader.native_handle()).unwrap();

    let buffer = multiplexer.allocate_registered_buffer(8).unwrap();
    let delivered: Arc<Mutex<Vec<Result<IoOutcome>>>> = Arc::new(Mutex::new(Vec::new()));

    let op = OperationConnection::read(&reader, vec![buffer.as_buffer()], 0, {
        let delivered = Arc::clone(&delivered);
        move |result| delivered.lock().unwrap().push(result)
    });
    let id = multiplexer.start_read(op).unwrap();

    let racer = std::thread::spawn({
        let multiplexer = Arc::clone(&multiplexer);
        move || {
            std::thread::sleep(Duration::from_millis(10));
            multiplexer.cancel(id).unwrap();
            let _ = writer.write_at(0, b"x", Deadline::infinite());
        }
    });

    drive_until(
        &multiplexer,
        || !delivered.lock().unwrap().is_empty(),
        Duration::from_secs(10),
    );
    racer.join().unwrap();

    // Give any late event a chance to double-deliver (it must not).
    let _ = multiplexer
        .run(64, Deadline::steady(Duration::from_millis(50)))
        .unwrap();

    let results = delivered.lock().unwrap();
    assert_eq!(results.len(), 1, "receiver must be invoked exactly once");
    match &results[0] {
        Err(Error::Canceled) => {}
        Ok(outcome) => assert_eq!(outcome.bytes_transferred(), 1),
        other => panic!("unexpected completion: {other:?}"),
    }

    assert_eq!(multiplexer.pending_io(), 0);
}

/// Parallel mode: several threads drive `run()` concurrently and every completion is still
/// delivered exactly once, on whichever thread picked it up.
#[test]
fn parallel_loop_threads_share_the_completion_work() {
    const PIPES: usize = 32;
    const LOOP_THREADS: usize = 3;

    let multiplexer = Arc::new(EpollMultiplexer::new().unwrap());

    let mut readers = Vec::with_capacity(PIPES);
    let mut writers = Vec::with_capacity(PIPES);
    for _ in 0..PIPES {
        let (reader, writer) = IoHandle::pipe().unwrap();
        multiplexer.register_handle(&reader.native_handle()).unwrap();
        readers.push(reader);
        writers.push(writer);
    }

    let delivered = Arc::new(AtomicUsize::new(0));

    for reader in &readers {
        let buffer = multiplexer.allocate_registered_buffer(8).unwrap();
        let descriptor = buffer.as_buffer();

        let op = OperationConnection::read(reader, vec![descriptor], 0, {
            let delivered = Arc::clone(&delivered);
            move |result: Result<IoOutcome>| {
                assert_eq!(result.unwrap().bytes_transferred(), 8);
                // The receiver owns the buffer until here.
                let _buffer = &buffer;
                delivered.fetch_add(1, Ordering::SeqCst);
            }
        });
        multiplexer.start_read(op).unwrap();
    }

    let loops: Vec<_> = (0..LOOP_THREADS)
        .map(|_| {
            std::thread::spawn({
                let multiplexer = Arc::clone(&multiplexer);
                let delivered = Arc::clone(&delivered);
                move || {
                    let started = Instant::now();
                    while delivered.load(Ordering::SeqCst) < PIPES {
                        assert!(started.elapsed() < Duration::from_secs(30));
                        multiplexer
                            .run(8, Deadline::steady(Duration::from_millis(50)))
                            .unwrap();
                    }
                }
            })
        })
        .collect();

    for writer in &writers {
        assert_eq!(
            writer
                .write_at(0, &7_u64.to_le_bytes(), Deadline::infinite())
                .unwrap(),
            8
        );
    }

    for thread in loops {
        thread.join().unwrap();
    }

    assert_eq!(delivered.load(Ordering::SeqCst), PIPES);
    assert_eq!(multiplexer.pending_io(), 0);
}

/// The synchronous handle surface forwards through an attached multiplexer.
#[test]
fn handle_forwards_synchronous_io_through_the_multiplexer() {
    let multiplexer: Arc<dyn IoMultiplexer> = Arc::new(EpollMultiplexer::new().unwrap());

    let (mut reader, mut writer) = IoHandle::pipe().unwrap();
    reader.set_multiplexer(Some(Arc::clone(&multiplexer))).unwrap();
    writer.set_multiplexer(Some(Arc::clone(&multiplexer))).unwrap();

    let writer_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(
            writer.write_at(0, b"routed", Deadline::infinite()).unwrap(),
            6
        );
        writer
    });

    // This read suspends in the multiplexer (not the kernel syscall) and this thread
    // drives the completion loop internally until the receiver fires.
    let mut storage = [0_u8; 16];
    let n = reader
        .read_at(0, &mut storage, Deadline::steady(Duration::from_secs(10)))
        .unwrap();

    assert_eq!(n, 6);
    assert_eq!(&storage[..6], b"routed");

    let _writer = writer_thread.join().unwrap();
}

/// Reciprocating completions submitted through a completion scope drain iteratively
/// instead of recursing.
#[test]
fn completion_scope_flattens_reentrant_chains() {
    let multiplexer: Arc<dyn IoMultiplexer> = Arc::new(EpollMultiplexer::new().unwrap());

    let (reader, writer) = IoHandle::pipe().unwrap();
    multiplexer.register_handle(&reader.native_handle()).unwrap();
    multiplexer.register_handle(&writer.native_handle()).unwrap();

    // Pre-buffer enough data that every chained read completes synchronously.
    for _ in 0..8 {
        let op =
            OperationConnection::write(&writer, vec![ConstBuffer::from_slice(b"y")], 0, |r| {
                r.unwrap();
            });
        multiplexer.start_write(op).unwrap();
    }

    let drained = std::cell::Cell::new(0);
    let depth = Arc::new(AtomicUsize::new(0));
    let max_depth = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));

    {
        let scope = CompletionScope::with_counter(&drained);
        let handle = scope.handle();

        // A chain of reads, each submitting the next from inside its receiver. With the
        // scope active, each nested submission's synchronous completion is captured, so
        // the observed depth never exceeds one.
        fn chain(
            multiplexer: &Arc<dyn IoMultiplexer>,
            reader: &IoHandle,
            handle: &manifold_io::ScopeHandle,
            remaining: usize,
            depth: &Arc<AtomicUsize>,
            max_depth: &Arc<AtomicUsize>,
            completions: &Arc<AtomicUsize>,
        ) {
            if remaining == 0 {
                return;
            }

            let buffer = multiplexer.allocate_registered_buffer(1).unwrap();

            let op = OperationConnection::read(reader, vec![buffer.as_buffer()], 0, {
                let multiplexer = Arc::clone(multiplexer);
                let reader_native = reader.native_handle();
                let handle = handle.clone();
                let depth = Arc::clone(depth);
                let max_depth = Arc::clone(max_depth);
                let completions = Arc::clone(completions);
                move |result| {
                    let now = depth.fetch_add(1, Ordering::SeqCst) + 1;
                    max_depth.fetch_max(now, Ordering::SeqCst);

                    result.unwrap();
                    completions.fetch_add(1, Ordering::SeqCst);

                    let reader = IoHandle::from_native(reader_native);
                    chain(
                        &multiplexer,
                        &reader,
                        &handle,
                        remaining - 1,
                        &depth,
                        &max_depth,
                        &completions,
                    );
                    // The temporary wrapper must not close the descriptor.
                    let _ = reader.take();

                    depth.fetch_sub(1, Ordering::SeqCst);
                }
            });

            multiplexer.start_read(handle.wrap(op)).unwrap();
        }

        chain(
            &multiplexer,
            &reader,
            &handle,
            4,
            &depth,
            &max_depth,
            &completions,
        );

        // The first completion was captured, not fired.
        assert_eq!(completions.load(Ordering::SeqCst), 0);
    }

    // Scope exit drained the whole chain iteratively.
    assert_eq!(completions.load(Ordering::SeqCst), 4);
    assert_eq!(drained.get(), 4);
    assert_eq!(max_depth.load(Ordering::SeqCst), 1);
    assert_eq!(multiplexer.pending_io(), 0);
}
