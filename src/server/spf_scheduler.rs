//! Debounces SPF triggers into `RunSpf` events for the control loop.
//!
//! The trigger channel has capacity 1 and is fed with `try_send`, so any
//! number of triggers raised while one is pending collapse into it.

use std::time::Duration;

use tokio::{
    sync::{mpsc, watch},
    time::{Instant, sleep_until},
};
use tracing::{debug, warn};

use crate::server::{
    events::{ControlEvent, Session},
    shutdown::wait_for_stop,
};

/// Waits `delay` after the first trigger of a burst and keeps at least `hold`
/// between two runs.
pub async fn run_spf_scheduler(
    delay: Duration,
    hold: Duration,
    session: Session,
    mut triggers: mpsc::Receiver<()>,
    events: mpsc::Sender<ControlEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut last_run: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = wait_for_stop(&mut stop) => break,
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
            }
        }

        let mut deadline = Instant::now() + delay;
        if let Some(last) = last_run {
            deadline = deadline.max(last + hold);
        }
        tokio::select! {
            _ = wait_for_stop(&mut stop) => break,
            _ = sleep_until(deadline) => {}
        }

        let mut coalesced = 0usize;
        while triggers.try_recv().is_ok() {
            coalesced += 1;
        }
        debug!(coalesced, "spf run scheduled");

        tokio::select! {
            _ = wait_for_stop(&mut stop) => break,
            sent = events.send(ControlEvent::RunSpf(session)) => {
                if sent.is_err() {
                    warn!("control loop gone, spf scheduler exiting");
                    break;
                }
            }
        }
        last_run = Some(Instant::now());
    }
    debug!("spf scheduler stopped");
}
