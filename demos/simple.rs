use scl::rwscl::FairRwLock;
use std::{sync::Arc, thread};

fn main() {
    let counter = Arc::new(FairRwLock::new(0).unwrap());

    let writer = thread::spawn({
        let counter = counter.clone();
        move || {
            for _ in 0..1000 {
                *counter.write().unwrap() += 1;
            }
        }
    });

    for _ in 0..1000 {
        println!("read {}", *counter.read().unwrap());
    }

    writer.join().unwrap();

    assert_eq!(*counter.read().unwrap(), 1000);
}
