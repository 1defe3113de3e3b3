//! Shared application state and service wiring.

use std::sync::Arc;

use docreview_core::aggregate_repository::{AggregateRepository, RepositorySettings};
use docreview_core::checkpoint::ProjectionStore;
use docreview_core::clock::Clock;
use docreview_core::error::DomainError;
use docreview_core::projection::EventPublisher;
use docreview_core::repository::{EventRepository, SnapshotRepository};
use docreview_core::rng::DeterministicRng;
use docreview_documents::application::projection::DocumentViewProjection;
use docreview_documents::domain::aggregates::Document;
use docreview_documents::domain::events::upcasters;
use docreview_projections::{
    BackgroundDispatcher, FailureTracker, ProjectionAdmin, ProjectionDispatcher,
    ProjectionSettings, RetryWorker,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::DispatchMode;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Time source for command timestamps.
    pub clock: Arc<dyn Clock>,
    /// Write side of the document context.
    pub documents: Arc<AggregateRepository<Document>>,
    /// The `document_view` read model.
    pub document_view: Arc<DocumentViewProjection>,
    /// Operator surface over the projections.
    pub admin: ProjectionAdmin,
    /// Flips to `true` on shutdown; cancels running replays.
    pub shutdown: watch::Receiver<bool>,
    /// Prometheus recorder handle, when one is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Attaches the Prometheus handle rendered by `GET /metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Storage backends the services run on.
#[derive(Clone)]
pub struct Storage {
    /// The event log.
    pub events: Arc<dyn EventRepository>,
    /// Aggregate snapshots.
    pub snapshots: Arc<dyn SnapshotRepository>,
    /// Checkpoints and failure records.
    pub projections: Arc<dyn ProjectionStore>,
}

/// Tuning for [`Services::build`].
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// Aggregate repository tuning.
    pub repository: RepositorySettings,
    /// Projection pipeline tuning.
    pub projections: ProjectionSettings,
    /// Projection delivery mode.
    pub dispatch_mode: DispatchMode,
}

/// Everything `main` needs to run the server and its background tasks.
pub struct Services {
    /// Handler state.
    pub state: AppState,
    /// The projection dispatcher, for the startup catch-up.
    pub dispatcher: Arc<ProjectionDispatcher>,
    /// Retries failed projection events.
    pub retry_worker: RetryWorker,
    /// Background lane tasks; empty in inline mode.
    pub lanes: Vec<JoinHandle<()>>,
}

impl Services {
    /// Wires the document context, the projection pipeline and the admin
    /// surface on top of `storage`.
    ///
    /// Background mode spawns one lane per projection, so it must run inside
    /// a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if two projections share a name.
    pub fn build(
        storage: Storage,
        clock: Arc<dyn Clock>,
        rng: Box<dyn DeterministicRng>,
        settings: ServiceSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, DomainError> {
        let upcasters = Arc::new(upcasters());
        let tracker = Arc::new(FailureTracker::new(
            Arc::clone(&storage.projections),
            Arc::clone(&clock),
            rng,
            settings.projections.retry,
        ));

        let document_view = Arc::new(DocumentViewProjection::new());
        let mut dispatcher = ProjectionDispatcher::new(
            Arc::clone(&storage.events),
            Arc::clone(&storage.projections),
            Arc::clone(&upcasters),
            Arc::clone(&tracker),
            Arc::clone(&clock),
            settings.projections.dispatch.batch_size,
        );
        dispatcher.register(document_view.clone())?;
        let dispatcher = Arc::new(dispatcher);

        let (publisher, lanes) = match settings.dispatch_mode {
            DispatchMode::Background => {
                let (background, lanes) =
                    BackgroundDispatcher::spawn(&dispatcher, settings.projections.dispatch, &shutdown);
                let publisher: Arc<dyn EventPublisher> = Arc::new(background);
                (publisher, lanes)
            }
            DispatchMode::Inline => {
                let publisher: Arc<dyn EventPublisher> = dispatcher.clone();
                (publisher, Vec::new())
            }
        };
        info!(mode = ?settings.dispatch_mode, lanes = lanes.len(), "projection dispatch configured");

        let documents = AggregateRepository::new(
            Arc::clone(&storage.events),
            upcasters,
            Arc::clone(&clock),
        )
        .with_snapshots(storage.snapshots)
        .with_publisher(publisher)
        .with_settings(settings.repository);

        let admin = ProjectionAdmin::new(
            Arc::clone(&dispatcher),
            tracker,
            storage.events,
            Arc::clone(&storage.projections),
            settings.projections.health,
        );
        let retry_worker = RetryWorker::new(
            Arc::clone(&dispatcher),
            storage.projections,
            Arc::clone(&clock),
            settings.projections.worker,
            settings.projections.retry.max_retries,
        );

        Ok(Self {
            state: AppState {
                clock,
                documents: Arc::new(documents),
                document_view,
                admin,
                shutdown,
                metrics: None,
            },
            dispatcher,
            retry_worker,
            lanes,
        })
    }
}
