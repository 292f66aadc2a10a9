//! Rust analogue of `u-scl/example/main.c`'s per-thread summary: two threads
//! with different scheduler weights contend for one `FairMutex`, each
//! holding it for a fixed simulated critical-section length, and the demo
//! prints how much total lock-hold time each thread accumulated. Under
//! weighted-fair scheduling the ratio of hold times should track the ratio
//! of the threads' weights rather than split evenly.

use scl::uscl::FairMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Worker {
    weight: u32,
    acquires: u64,
    hold: Duration,
}

fn run(lock: &Arc<FairMutex<()>>, weight: u32, stop: &Arc<AtomicBool>) -> Worker {
    lock.register_thread(Some(weight)).expect("register_thread");

    let mut acquires = 0u64;
    let mut hold = Duration::ZERO;
    while !stop.load(Ordering::Relaxed) {
        let start = Instant::now();
        let guard = lock.lock().expect("lock");
        acquires += 1;
        // Simulated critical section: busy-spin for a fixed duration, the
        // same shape as main.c's `cs_delta` cycle-counted spin loop.
        let cs_end = Instant::now() + Duration::from_micros(50);
        while Instant::now() < cs_end {}
        drop(guard);
        hold += start.elapsed();

        thread::sleep(Duration::from_micros(50));
    }
    Worker { weight, acquires, hold }
}

fn main() {
    let lock = Arc::new(FairMutex::new(()).expect("FairMutex::new"));
    let stop = Arc::new(AtomicBool::new(false));

    let weights = [1u32, 3u32];
    let handles: Vec<_> = weights
        .iter()
        .map(|&weight| {
            let lock = lock.clone();
            let stop = stop.clone();
            thread::spawn(move || run(&lock, weight, &stop))
        })
        .collect();

    thread::sleep(Duration::from_secs(1));
    stop.store(true, Ordering::Relaxed);

    for (i, h) in handles.into_iter().enumerate() {
        let w = h.join().expect("worker panicked");
        println!(
            "thread {i}: weight={} acquires={} hold_time={:?}",
            w.weight, w.acquires, w.hold
        );
    }
}
