//! The watch orchestrator: backlog first, then live events, one marker at a
//! time through claim → resolve → announce → invoke → notify.

use std::fmt;
use std::future::Future;
use std::path::Path;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::basecaller::{Basecaller, InvocationResult};
use crate::config::{IndexConfig, WatchConfig};
use crate::error::Result;
use crate::index::{MarkerIndex, Outcome};
use crate::mailer::{self, DeliveryResult, Dispatcher};
use crate::paths::RunFolderName;
use crate::resolver::{PathResolver, Resolution};
use crate::types::ExperimentRequest;
use crate::watch::{self, MarkerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Claimed,
    Resolving,
    Invoking,
    Notifying,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Pending => "pending",
            Stage::Claimed => "claimed",
            Stage::Resolving => "resolving",
            Stage::Invoking => "invoking",
            Stage::Notifying => "notifying",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What happened to one claimed marker.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub event: MarkerEvent,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation: Option<InvocationResult>,
    /// Delivery of the basecalling-started notice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announced: Option<DeliveryResult>,
    /// Delivery of the outcome report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryResult>,
}

impl Report {
    fn new(event: MarkerEvent) -> Self {
        Self {
            event,
            stage: Stage::Pending,
            resolution: None,
            invocation: None,
            announced: None,
            delivery: None,
        }
    }

    fn advance(&mut self, next: Stage) {
        tracing::info!(
            marker = %self.event.marker.display(),
            from = %self.stage,
            to = %next,
            "stage transition"
        );
        self.stage = next;
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Processes single marker events. Holds the one piece of mutable state,
/// the marker index.
pub struct Pipeline {
    request: ExperimentRequest,
    resolver: PathResolver,
    index: MarkerIndex,
    basecaller: Basecaller,
    dispatcher: Dispatcher,
}

impl Pipeline {
    pub fn new(
        request: ExperimentRequest,
        index: MarkerIndex,
        basecaller: Basecaller,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            resolver: PathResolver::new(request.input_type),
            request,
            index,
            basecaller,
            dispatcher,
        }
    }

    pub fn request(&self) -> &ExperimentRequest {
        &self.request
    }

    pub fn index(&self) -> &MarkerIndex {
        &self.index
    }

    /// True when `marker` sits under a run folder named for the target date.
    /// Markers from other days are left alone and never claimed.
    fn concerns_target_date(&self, marker: &Path) -> bool {
        marker
            .strip_prefix(&self.request.root)
            .ok()
            .and_then(|rel| rel.components().next())
            .and_then(|c| c.as_os_str().to_str())
            .and_then(|name| RunFolderName::parse(name).ok())
            .is_some_and(|run| run.date == self.request.date)
    }

    /// Drive one marker through the pipeline.
    ///
    /// Returns `None` when the marker was not claimed: already seen, or not
    /// for the target date.
    pub async fn process(&self, event: MarkerEvent) -> Option<Report> {
        if !self.concerns_target_date(&event.marker) {
            tracing::debug!(marker = %event.marker.display(), "marker not for the target date; ignoring");
            return None;
        }
        match self.index.try_claim(&event.marker) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(
                    marker = %event.marker.display(),
                    origin = %event.origin,
                    "marker already claimed; skipping"
                );
                return None;
            }
            Err(e) => {
                tracing::error!(marker = %event.marker.display(), "cannot claim marker: {e}");
                return None;
            }
        }

        let mut report = Report::new(event);
        report.advance(Stage::Claimed);

        report.advance(Stage::Resolving);
        let resolution = match self.resolver.resolve_marker(
            &self.request.root,
            self.request.date,
            &report.event.marker,
        ) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(marker = %report.event.marker.display(), "resolution failed: {e}");
                self.complete(&report.event.marker, Outcome::Failed { detail: e.to_string() });
                report.advance(Stage::Notifying);
                report.delivery = Some(
                    self.dispatcher
                        .notify_unresolved(&self.request, &report.event, &e)
                        .await,
                );
                report.advance(Stage::Failed);
                return Some(report);
            }
        };
        report.event.experiment_dir = Some(resolution.experiment_dir.clone());

        let command_line = self.basecaller.build_argv(&resolution, &self.request).join(" ");
        report.announced = Some(
            self.dispatcher
                .notify_started(&self.request, &report.event, &resolution, &command_line)
                .await,
        );

        report.advance(Stage::Invoking);
        let invocation = self.basecaller.run(&resolution, &self.request).await;
        let outcome = match &invocation.failure {
            None => Outcome::Succeeded {
                detail: format!("output in {}", invocation.output_dir.display()),
            },
            Some(failure) => Outcome::Failed {
                detail: failure.to_string(),
            },
        };
        let succeeded = invocation.succeeded();
        self.complete(&report.event.marker, outcome);

        report.advance(Stage::Notifying);
        let delivery = self
            .dispatcher
            .notify(&self.request, &report.event, &invocation)
            .await;

        report.resolution = Some(resolution);
        report.invocation = Some(invocation);
        report.delivery = Some(delivery);
        report.advance(if succeeded { Stage::Done } else { Stage::Failed });
        Some(report)
    }

    fn complete(&self, marker: &Path, outcome: Outcome) {
        if let Err(e) = self.index.complete(marker, &outcome) {
            tracing::error!(marker = %marker.display(), "cannot record outcome: {e}");
        }
    }

    /// Record a marker whose processing was cut short by shutdown.
    fn abandon(&self, marker: &Path) {
        tracing::warn!(
            marker = %marker.display(),
            "shutdown during processing; any running basecaller is left to finish on its own"
        );
        self.complete(
            marker,
            Outcome::Failed {
                detail: "interrupted by shutdown".into(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    fn record(&mut self, report: Option<&Report>) {
        match report {
            None => self.skipped += 1,
            Some(r) => {
                self.processed += 1;
                if r.stage == Stage::Done {
                    self.succeeded += 1;
                } else {
                    self.failed += 1;
                }
            }
        }
    }
}

pub struct WatchOrchestrator {
    pipeline: Pipeline,
    queue_capacity: usize,
}

impl WatchOrchestrator {
    pub fn new(pipeline: Pipeline, queue_capacity: usize) -> Self {
        Self {
            pipeline,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Open the marker index and mail transport described by `config`.
    pub fn from_config(config: WatchConfig) -> Result<Self> {
        let index = match &config.index {
            IndexConfig::Durable { path } => {
                let index = MarkerIndex::open(path)?;
                tracing::info!(path = %path.display(), "using durable marker index");
                index
            }
            IndexConfig::InMemory => {
                tracing::warn!(
                    "marker index is in memory only; after a restart the backlog scan will re-run finished markers"
                );
                MarkerIndex::in_memory()
            }
        };
        let dispatcher = Dispatcher::new(mailer::transport_from_config(&config.mail));
        let pipeline = Pipeline::new(
            config.request,
            index,
            Basecaller::new(config.tool),
            dispatcher,
        );
        Ok(Self::new(pipeline, config.queue_capacity))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Process the backlog, then live events, until `shutdown` resolves or
    /// the watch ends.
    ///
    /// The watcher is started before the backlog scan so markers created
    /// during the scan are queued rather than missed. Markers seen by both
    /// are deduplicated by the claim gate.
    pub async fn run<F>(&self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let root = self.pipeline.request().root.clone();
        let (tx, mut rx) = mpsc::channel(self.queue_capacity);
        let watcher = watch::spawn_watcher(&root, tx)?;
        tokio::pin!(shutdown);

        let mut summary = RunSummary::default();
        let backlog = watch::scan_backlog(&root);
        tracing::info!(count = backlog.len(), "processing pre-existing markers");

        let mut stopping = false;
        for event in backlog {
            if !self.step(event, &mut shutdown, &mut summary).await {
                stopping = true;
                break;
            }
        }

        if !stopping {
            tracing::info!(root = %root.display(), date = %self.pipeline.request().date_stamp(), "waiting for new markers");
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    next = rx.recv() => match next {
                        Some(event) => {
                            if !self.step(event, &mut shutdown, &mut summary).await {
                                break;
                            }
                        }
                        None => {
                            tracing::warn!("filesystem watch ended");
                            break;
                        }
                    },
                }
            }
        }

        // Close the queue first so a watcher callback blocked on a full
        // queue returns before the watcher is torn down.
        drop(rx);
        drop(watcher);
        tracing::info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "watch stopped"
        );
        Ok(summary)
    }

    /// Process one event unless shutdown arrives first. Returns `false` on
    /// shutdown.
    async fn step<S>(&self, event: MarkerEvent, shutdown: &mut S, summary: &mut RunSummary) -> bool
    where
        S: Future<Output = ()> + Unpin,
    {
        let marker = event.marker.clone();
        tokio::select! {
            biased;
            _ = shutdown => {
                self.pipeline.abandon(&marker);
                false
            }
            report = self.pipeline.process(event) => {
                summary.record(report.as_ref());
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
