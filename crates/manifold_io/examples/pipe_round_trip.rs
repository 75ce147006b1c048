// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Moves a few bytes through an anonymous pipe, once over the synchronous default path
//! and once through the platform's preferred multiplexer.

use std::time::Duration;

use manifold_io::{
    best_available, Buffer, Deadline, IoHandle, IoMultiplexer, OperationConnection,
};

fn main() -> manifold_io::Result<()> {
    // Synchronous path: no multiplexer involved, the read blocks in the kernel.
    let (reader, writer) = IoHandle::pipe()?;

    let writer_thread = std::thread::spawn(move || {
        writer.write_at(0, b"hello over the pipe", Deadline::infinite())
    });

    let mut storage = [0_u8; 64];
    let n = reader.read_at(0, &mut storage, Deadline::infinite())?;
    println!(
        "synchronous read: {n} bytes: {:?}",
        String::from_utf8_lossy(&storage[..n])
    );
    writer_thread.join().expect("writer thread panicked")?;

    // Multiplexed path: the read suspends in the multiplexer and a completion loop
    // delivers it to the receiver.
    let multiplexer = best_available(1)?;

    let (reader, writer) = IoHandle::pipe()?;
    multiplexer.register_handle(&reader.native_handle())?;

    let buffer = multiplexer.allocate_registered_buffer(64)?;
    let op = OperationConnection::read(&reader, vec![buffer.as_buffer()], 0, {
        let buffer = buffer.clone();
        move |result| {
            let outcome = result.expect("read failed");
            // SAFETY: The operation has completed; nothing else touches this buffer.
            let bytes = unsafe { &buffer.as_slice()[..outcome.bytes_transferred()] };
            println!(
                "multiplexed read: {} bytes: {:?}",
                outcome.bytes_transferred(),
                String::from_utf8_lossy(bytes)
            );
        }
    })
    .with_deadline(Deadline::steady(Duration::from_secs(5)));
    multiplexer.start_read(op)?;

    writer.write_at(0, b"hello through the multiplexer", Deadline::infinite())?;

    while multiplexer.pending_io() > 0 {
        multiplexer.run(64, Deadline::steady(Duration::from_millis(100)))?;
    }

    Ok(())
}
