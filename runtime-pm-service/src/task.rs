//! Tasks driving a [`WorkQueue`]
use embassy_futures::select::{Either, select};
use embassy_time::{Instant, Timer};

use crate::queue::WorkQueue;
use crate::{info, trace};

/// Run queued requests, several workers may share a queue
pub async fn worker<const N: usize>(queue: &'static WorkQueue<N>) {
    info!("Starting runtime PM worker");
    loop {
        let device = queue.next_work().await;
        trace!("Running work for device {}", device.id().0);
        device.run_work().await;
    }
}

/// Fire suspend timers as they expire
pub async fn timer<const N: usize>(queue: &'static WorkQueue<N>) {
    info!("Starting runtime PM timer");
    loop {
        match queue.next_deadline() {
            Some(deadline) => {
                if let Either::First(()) = select(Timer::at(deadline), queue.timer_changed()).await {
                    queue.fire_expired(Instant::now());
                }
            }
            None => queue.timer_changed().await,
        }
    }
}
