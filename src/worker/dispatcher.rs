use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    accessors::{get_details, get_list},
    bounds::query_nodes,
    config_synth::get_config,
    protocol::{Inbound, OutboundMessage, WorkerRequest, WorkerResponse},
    readiness::ReadinessGate,
    search::search,
};
use crate::{
    abstract_filtering::{LocalFiltering, TreeFiltering},
    config::WorkerConfig,
    file_format::{ingest_text, read_upload_text, Dataset, StatusMessage, UploadPayload},
    worker_error::{Result, WorkerError},
};

/// Everything a request handler may touch, shared by every in-flight request.
///
/// Search results are cached on the loaded `Dataset` itself, so replacing the
/// dataset also replaces the cache.
pub struct WorkerState {
    pub gate: ReadinessGate,
    pub filtering: Box<dyn TreeFiltering>,
    pub config: WorkerConfig,
    outbox: UnboundedSender<OutboundMessage>,
    /// Handed out to uploads in the order they were received.
    upload_seq: AtomicU64,
    /// Sequence number of the upload currently published.
    published_seq: Mutex<u64>,
}

impl WorkerState {
    fn post(&self, response: WorkerResponse, request_id: Option<u64>) {
        // The receiving side only goes away when the embedding application is
        // shutting down, at which point nobody wants the answer.
        if self
            .outbox
            .send(OutboundMessage {
                response,
                request_id,
            })
            .is_err()
        {
            debug!("outbox closed, dropping response");
        }
    }

    /// Publish the dataset from upload number `seq` unless a later upload has
    /// already been published.  Overlapping uploads may finish ingesting in
    /// any order; the one received last wins.
    pub fn publish_upload(&self, seq: u64, dataset: Arc<Dataset>) -> bool {
        let mut published = self
            .published_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if seq < *published {
            return false;
        }
        *published = seq;
        self.gate.publish(dataset);
        true
    }
}

/// The worker: owns the loaded dataset and answers requests about it.
///
/// Each request runs as its own task, so a request waiting for the dataset
/// doesn't hold up the ones behind it and responses may come back in any
/// order.
#[derive(Clone)]
pub struct Worker {
    state: Arc<WorkerState>,
}

impl Worker {
    pub fn new(config: WorkerConfig, outbox: UnboundedSender<OutboundMessage>) -> Worker {
        let filtering = Box::new(LocalFiltering::from_config(&config));
        Worker::with_filtering(config, filtering, outbox)
    }

    pub fn with_filtering(
        config: WorkerConfig,
        filtering: Box<dyn TreeFiltering>,
        outbox: UnboundedSender<OutboundMessage>,
    ) -> Worker {
        Worker {
            state: Arc::new(WorkerState {
                gate: ReadinessGate::new(),
                filtering,
                config,
                outbox,
                upload_seq: AtomicU64::new(0),
                published_seq: Mutex::new(0),
            }),
        }
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Start handling `inbound`.  Uploads are numbered here, in the order
    /// requests arrive, rather than when their task gets to run.
    pub fn spawn_request(&self, inbound: Inbound) -> JoinHandle<()> {
        let state = self.state.clone();
        let span = info_span!(
            "dispatch",
            request_type = inbound.request.type_name(),
            request_id = ?inbound.request_id
        );
        match inbound.request {
            WorkerRequest::Upload(payload) => {
                let seq = state.upload_seq.fetch_add(1, Ordering::SeqCst) + 1;
                let request_id = inbound.request_id;
                tokio::spawn(
                    async move { upload(&state, payload, seq, request_id).await }.instrument(span),
                )
            }
            request => {
                let request_id = inbound.request_id;
                tokio::spawn(dispatch(state, request, request_id).instrument(span))
            }
        }
    }

    /// Serve requests until `inbox` closes, then let in-flight requests
    /// finish.  Requests stuck waiting for a dataset that never arrives keep
    /// this from returning, same as they would keep a caller waiting.
    pub async fn run(&self, mut inbox: UnboundedReceiver<Inbound>) {
        let mut in_flight: Vec<JoinHandle<()>> = vec![];
        while let Some(inbound) = inbox.recv().await {
            in_flight.retain(|handle| !handle.is_finished());
            in_flight.push(self.spawn_request(inbound));
        }
        info!(in_flight = in_flight.len(), "inbox closed");
        for handle in in_flight {
            if let Err(err) = handle.await {
                warn!(%err, "request task failed");
            }
        }
    }
}

async fn dispatch(state: Arc<WorkerState>, request: WorkerRequest, request_id: Option<u64>) {
    let request_type = request.type_name();
    let response = match answer(&state, request).await {
        Ok(response) => response,
        Err(err) => {
            debug!(%err, "request failed");
            WorkerResponse::error(request_type, &err)
        }
    };
    state.post(response, request_id);
}

async fn answer(state: &WorkerState, request: WorkerRequest) -> Result<WorkerResponse> {
    let dataset = state.gate.wait_ready().await;
    let filtering = state.filtering.as_ref();
    Ok(match request {
        WorkerRequest::Query { bounds } => {
            WorkerResponse::Query(query_nodes(&dataset, filtering, bounds.as_ref()).await?)
        }
        WorkerRequest::Search {
            search: raw_spec,
            bounds,
        } => {
            let cache = dataset.result_cache(state.config.cache_budget);
            WorkerResponse::Search(
                search(&dataset, filtering, cache, &raw_spec, bounds.as_ref()).await?,
            )
        }
        WorkerRequest::Config => WorkerResponse::Config(get_config(&dataset, &state.config)),
        WorkerRequest::Details { node_id } => WorkerResponse::Details(get_details(&dataset, node_id)?),
        WorkerRequest::List { node_id, key } => {
            WorkerResponse::List(get_list(&dataset, filtering, node_id, &key).await?)
        }
        WorkerRequest::Upload(_) => {
            return Err(WorkerError::invariant("uploads are handled by `upload`"));
        }
    })
}

/// Load a dataset and publish it.  Progress and failure go out as status
/// messages under the upload's request id; on failure the previous dataset
/// (if any) stays in place.
async fn upload(state: &Arc<WorkerState>, payload: UploadPayload, seq: u64, request_id: Option<u64>) {
    let status = match load(state, payload, request_id).await {
        Ok(dataset) => {
            if state.publish_upload(seq, Arc::new(dataset)) {
                StatusMessage::progress("Dataset ready", Some(100))
            } else {
                info!(seq, "a later upload was published first");
                StatusMessage::failure("Superseded by a later upload".to_string())
            }
        }
        Err(err) => {
            warn!(%err, "upload failed");
            StatusMessage::failure(err.message())
        }
    };
    state.post(WorkerResponse::Status(status), request_id);
}

async fn load(
    state: &Arc<WorkerState>,
    payload: UploadPayload,
    request_id: Option<u64>,
) -> Result<Dataset> {
    let kind = payload.kind()?;
    info!(filename = ?payload.filename, ?kind, "loading upload");
    let text = read_upload_text(&payload).await?;

    let reporter_state = state.clone();
    let span = tracing::Span::current();
    let dataset = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let report = move |status: StatusMessage| {
            reporter_state.post(WorkerResponse::Status(status), request_id)
        };
        ingest_text(kind, &text, &report)
    })
    .await
    .map_err(|err| WorkerError::invariant(format!("ingestion task failed: {}", err)))??;

    info!(nodes = dataset.nodes.len(), "dataset loaded");
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::file_format::dataset::test_support::{five_node_dataset, node};

    #[test]
    fn test_newest_upload_wins() {
        let (outbox, _outbound) = unbounded_channel();
        let worker = Worker::new(WorkerConfig::default(), outbox);
        let single =
            Dataset::build(vec![node(0, 0, 0.0, 0.0, json!({}))], vec![], vec![], Map::new())
                .unwrap();

        assert!(worker.state().publish_upload(2, Arc::new(five_node_dataset())));
        // Upload 1 was sent earlier but finished later.
        assert!(!worker.state().publish_upload(1, Arc::new(single)));
        assert_eq!(worker.state().gate.current().unwrap().nodes.len(), 5);
    }

    #[tokio::test]
    async fn test_upload_statuses_carry_request_id() {
        let (outbox, mut outbound) = unbounded_channel();
        let worker = Worker::new(WorkerConfig::default(), outbox);
        let inbound = Inbound::from_value(json!({
            "type": "upload",
            "request_id": 77,
            "filename": "t.nwk",
            "filetype": "nwk",
            "data": "(A,B);"
        }))
        .unwrap();
        worker.spawn_request(inbound).await.unwrap();

        let mut statuses = vec![];
        while let Ok(msg) = outbound.try_recv() {
            statuses.push(msg);
        }
        assert!(!statuses.is_empty());
        assert!(statuses.iter().all(|msg| msg.request_id == Some(77)));
        assert_eq!(
            statuses.last().unwrap().response,
            WorkerResponse::Status(StatusMessage::progress("Dataset ready", Some(100)))
        );
    }
}
