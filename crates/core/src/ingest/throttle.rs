use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

// add() consumes a permit and stamps the admission; clean() discards stamps
// older than the window and reopens their slots. A permit only returns after
// its stamp ages out, so no trailing window holds more than max_per_window.
pub struct Throttle {
    window: Duration,
    permits: Semaphore,
    admissions: Mutex<VecDeque<Instant>>,
}

impl Throttle {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        let max_per_window = max_per_window.max(1);
        Self {
            window,
            permits: Semaphore::new(max_per_window as usize),
            admissions: Mutex::new(VecDeque::with_capacity(max_per_window as usize)),
        }
    }

    pub async fn add(&self) {
        let permit = self
            .permits
            .acquire()
            .await
            .expect("throttle semaphore is never closed");
        permit.forget();
        self.admissions.lock().await.push_back(Instant::now());
    }

    pub async fn clean(&self) {
        let Some(cutoff) = Instant::now().checked_sub(self.window) else {
            return;
        };
        let mut freed = 0usize;
        {
            let mut admissions = self.admissions.lock().await;
            while let Some(stamp) = admissions.front() {
                if *stamp <= cutoff {
                    admissions.pop_front();
                    freed += 1;
                } else {
                    break;
                }
            }
        }
        if freed > 0 {
            self.permits.add_permits(freed);
        }
    }

    // Runs until the handle is stopped; dropping it without stop() leaks the
    // task.
    pub fn spawn_cleaner(self: &Arc<Self>, every: Duration) -> ThrottleCleaner {
        let throttle = Arc::clone(self);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = tick.tick() => throttle.clean().await,
                    _ = stop_rx.changed() => break,
                }
            }
        });
        ThrottleCleaner {
            stop: stop_tx,
            handle,
        }
    }
}

pub struct ThrottleCleaner {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ThrottleCleaner {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}
