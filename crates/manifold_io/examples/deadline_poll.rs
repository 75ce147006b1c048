// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Demonstrates the three deadline shapes on a non-blocking pipe: poll (zero), relative
//! and infinite.

use std::time::{Duration, Instant};

use manifold_io::{Deadline, Error, IoHandle};

fn main() -> manifold_io::Result<()> {
    let (mut reader, writer) = IoHandle::pipe()?;
    reader.set_nonblocking()?;

    let mut storage = [0_u8; 16];

    // Zero deadline: report immediately.
    match reader.read_at(0, &mut storage, Deadline::zero()) {
        Err(Error::TimedOut) => println!("poll: nothing buffered yet"),
        other => println!("poll: unexpected result {other:?}"),
    }

    // Relative deadline: wait it out.
    let started = Instant::now();
    match reader.read_at(0, &mut storage, Duration::from_millis(250).into()) {
        Err(Error::TimedOut) => {
            println!("deadline: timed out after {:?}", started.elapsed());
        }
        other => println!("deadline: unexpected result {other:?}"),
    }

    // With data buffered, even a poll succeeds.
    writer.write_at(0, b"now", Deadline::infinite())?;
    let n = reader.read_at(0, &mut storage, Deadline::zero())?;
    println!(
        "poll with data: {n} bytes: {:?}",
        String::from_utf8_lossy(&storage[..n])
    );

    Ok(())
}
