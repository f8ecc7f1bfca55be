//! Basic weft example
//!
//! Spawns fibers on an IoManager, sleeps cooperatively, and watches a
//! pipe for readability.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use weft::{Event, IoManager};

fn pipe_pair() -> anyhow::Result<(RawFd, RawFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        anyhow::bail!("pipe: {}", std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let io = IoManager::new(4, false, "weft-basic")?;
    let done = Arc::new(AtomicUsize::new(0));

    // Two fibers interleaving cooperative sleeps.
    for name in ["tick", "tock"] {
        let done = done.clone();
        io.schedule(move || {
            let start = Instant::now();
            for round in 0..3 {
                weft::sleep_ms(100);
                tracing::info!("[{}] round {} at {:?}", name, round, start.elapsed());
            }
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    // One-shot readiness: a callback fires when the pipe becomes readable.
    let (read_end, write_end) = pipe_pair()?;
    {
        let done = done.clone();
        io.add_event_with(read_end, Event::Read, move || {
            let mut buf = [0u8; 16];
            let n = unsafe { libc::read(read_end, buf.as_mut_ptr() as *mut libc::c_void, 16) };
            tracing::info!(
                "pipe readable: {:?}",
                String::from_utf8_lossy(&buf[..n.max(0) as usize])
            );
            done.fetch_add(1, Ordering::SeqCst);
        })?;
    }

    // A timer feeds the pipe halfway through the sleeps.
    io.add_timer(
        150,
        move || {
            let msg = b"ping";
            unsafe { libc::write(write_end, msg.as_ptr() as *const libc::c_void, msg.len()) };
        },
        false,
    );

    while done.load(Ordering::SeqCst) < 3 {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    IoManager::stop(&io);
    unsafe {
        libc::close(read_end);
        libc::close(write_end);
    }
    tracing::info!("all fibers done");
    Ok(())
}
