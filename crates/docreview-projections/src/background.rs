//! Asynchronous delivery: one bounded channel and task per projection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, warn};

use docreview_core::projection::EventPublisher;
use docreview_core::repository::StoredEvent;

use crate::config::DispatchSettings;
use crate::dispatcher::ProjectionDispatcher;

/// Publisher that hands committed events to per-projection background lanes
/// instead of delivering them on the writer's task.
///
/// A full lane drops the batch; the lane's periodic catch-up reads the
/// dropped events back from the log, so nothing is lost.
#[derive(Debug)]
pub struct BackgroundDispatcher {
    lanes: Vec<(String, mpsc::Sender<Vec<StoredEvent>>)>,
}

impl BackgroundDispatcher {
    /// Spawns one task per registered projection. Tasks exit when
    /// `shutdown` flips to `true` or its sender is dropped.
    #[must_use]
    pub fn spawn(
        dispatcher: &Arc<ProjectionDispatcher>,
        settings: DispatchSettings,
        shutdown: &watch::Receiver<bool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut lanes = Vec::new();
        let mut handles = Vec::new();
        for name in dispatcher.projection_names() {
            let (tx, rx) = mpsc::channel(settings.lane_capacity.max(1));
            handles.push(tokio::spawn(run_lane(
                Arc::clone(dispatcher),
                name.to_owned(),
                rx,
                settings,
                shutdown.clone(),
            )));
            lanes.push((name.to_owned(), tx));
        }
        (Self { lanes }, handles)
    }
}

#[async_trait]
impl EventPublisher for BackgroundDispatcher {
    async fn publish(&self, events: &[StoredEvent]) {
        if events.is_empty() {
            return;
        }
        for (name, lane) in &self.lanes {
            match lane.try_send(events.to_vec()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(projection = %name, "lane full, catch-up will deliver");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(projection = %name, "lane closed, events not queued");
                }
            }
        }
    }
}

async fn run_lane(
    dispatcher: Arc<ProjectionDispatcher>,
    name: String,
    mut rx: mpsc::Receiver<Vec<StoredEvent>>,
    settings: DispatchSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut catch_up = interval(settings.catch_up_interval.max(Duration::from_millis(1)));
    catch_up.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = rx.recv() => {
                let Some(events) = received else { break };
                if let Err(err) = dispatcher.deliver_to(&name, &events).await {
                    error!(projection = %name, error = %err, "background delivery failed");
                }
            }
            _ = catch_up.tick() => {
                if let Err(err) = dispatcher.catch_up(&name).await {
                    error!(projection = %name, error = %err, "background catch-up failed");
                }
            }
        }
    }
    debug!(projection = %name, "background lane stopped");
}
