//! Ordered parallel pipeline: items are produced concurrently on a fixed
//! set of worker threads and consumed strictly in input order on the calling
//! thread. Used by the index build, where blob byte ranges are discovered
//! sequentially but decode-and-classify of each blob is independent work.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{mpsc::sync_channel, Arc};

use parking_lot::{Condvar, Mutex};

/// Runs `produce` over `iter` on all rayon threads and feeds the results to
/// `consume` in input order.
///
/// In-flight items are bounded to twice the thread count so that a slow
/// consumer cannot pile up produced data. The value returned by `consume`
/// is dropped on a separate thread, since decoded blocks carry a lot of
/// allocations and freeing them inline would stall the ordered stream.
pub fn process<Iter, Item, Producer, Data, Consumer, Error, Garbage>(
    iter: Iter,
    produce: Producer,
    mut consume: Consumer,
) -> Result<(), Error>
where
    Iter: Iterator<Item = Item> + Send,
    Producer: Fn(Item) -> Data + Sync,
    Data: Send,
    Consumer: FnMut(Data) -> Result<Garbage, Error>,
    Garbage: Send + 'static,
{
    let num_threads = rayon::current_num_threads();
    let window = 2 * num_threads;

    let iter = Arc::new(Mutex::new(iter.enumerate()));
    // highest input position the workers are allowed to hand over
    let admitted = Arc::new((Mutex::new(window), Condvar::new()));

    crossbeam::thread::scope(|scope| {
        let (sender, receiver) = sync_channel(window);
        for _ in 0..num_threads {
            let sender = sender.clone();
            let iter = iter.clone();
            let admitted = admitted.clone();
            let produce = &produce;
            scope.spawn(move |_| loop {
                let (pos, item) = match iter.lock().next() {
                    None => break,
                    Some(next) => next,
                };

                let data = produce(item);

                let (limit, readmit) = &*admitted;
                {
                    let mut guard = limit.lock();
                    while *guard <= pos {
                        readmit.wait(&mut guard);
                    }
                }

                sender.send((pos, data)).unwrap();
            });
        }
        // make sure iteration finishes once all worker senders are gone
        drop(sender);

        let (garbage_sender, garbage_receiver) = sync_channel::<Garbage>(window);
        std::thread::spawn(move || {
            for garbage in garbage_receiver {
                drop(garbage);
            }
        });

        let mut pending = BTreeMap::new();
        let mut next_pos = 0;
        let mut failure = None;
        for (pos, data) in receiver {
            if failure.is_some() {
                // drain the channel so that no worker blocks on send
                continue;
            }
            pending.insert(Reverse(pos), data);
            while let Some(data) = pending.remove(&Reverse(next_pos)) {
                {
                    let mut guard = admitted.0.lock();
                    *guard += 1;
                    admitted.1.notify_all();
                }

                next_pos += 1;
                match consume(data) {
                    Ok(garbage) => garbage_sender.send(garbage).unwrap(),
                    Err(e) => {
                        failure = Some(e);
                        // unblock workers still waiting for admission
                        let mut guard = admitted.0.lock();
                        *guard = usize::MAX;
                        admitted.1.notify_all();
                        break;
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
    .expect("worker thread panicked")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consumes_in_input_order() {
        let mut seen = Vec::new();
        process(
            0..100u32,
            |i| i * 2,
            |x| -> Result<(), ()> {
                seen.push(x);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(seen, (0..100).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn consumer_error_stops_the_pipeline() {
        let result = process(
            0..1000u32,
            |i| i,
            |x| if x == 5 { Err("boom") } else { Ok(()) },
        );
        assert_eq!(result, Err("boom"));
    }
}
