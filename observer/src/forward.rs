//! Best-effort forwarding of events to a remote endpoint
//!
//! Forwarding never blocks or fails a collection cycle. Events are queued
//! into a bounded channel; when the queue is full the event is dropped and
//! counted. A dispatcher drains the queue with a fixed number of concurrent
//! requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ObserverConfig;
use crate::error::{ForwardError, ForwardResult};
use crate::event::Event;
use crate::metrics::ObserverMetrics;

/// Fire-and-forget relay of individual events
pub trait ForwardingSink: Send + Sync {
    /// Hand an event over for delivery; never blocks
    fn forward(&self, event: Event);
}

/// Forwards each event as a JSON `POST` to an HTTP endpoint
pub struct HttpForwarder {
    endpoint: String,
    queue: mpsc::Sender<Event>,
    metrics: Arc<ObserverMetrics>,
    dispatcher: JoinHandle<()>,
}

impl HttpForwarder {
    /// Build the client and spawn the dispatcher
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        endpoint: &str,
        config: &ObserverConfig,
        metrics: Arc<ObserverMetrics>,
    ) -> ForwardResult<Self> {
        reqwest::Url::parse(endpoint).map_err(|e| ForwardError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.forward_timeout())
            .build()
            .map_err(ForwardError::Client)?;

        let (queue, rx) = mpsc::channel(config.forward_queue_capacity);
        let dispatcher = tokio::spawn(dispatch(
            rx,
            client,
            endpoint.to_string(),
            Arc::new(Semaphore::new(config.forward_workers)),
            metrics.clone(),
        ));

        Ok(Self {
            endpoint: endpoint.to_string(),
            queue,
            metrics,
            dispatcher,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop accepting events and give queued requests `grace` to finish
    pub async fn shutdown(self, grace: Duration) {
        let Self {
            queue, dispatcher, ..
        } = self;
        drop(queue);

        let abort = dispatcher.abort_handle();
        if tokio::time::timeout(grace, dispatcher).await.is_err() {
            warn!("Forwarding queue not drained within {:?}, dropping the rest", grace);
            abort.abort();
        }
    }
}

impl ForwardingSink for HttpForwarder {
    fn forward(&self, event: Event) {
        match self.queue.try_send(event) {
            Ok(()) => self.metrics.forward_enqueued.inc(),
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.metrics.forward_dropped.inc();
                debug!(pid = event.pid, "Forwarding queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.forward_dropped.inc();
            }
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Event>,
    client: reqwest::Client,
    endpoint: String,
    permits: Arc<Semaphore>,
    metrics: Arc<ObserverMetrics>,
) {
    let endpoint: Arc<str> = endpoint.into();
    let workers = permits.available_permits();

    while let Some(event) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let client = client.clone();
        let endpoint = endpoint.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = post_event(&client, &endpoint, &event).await {
                metrics.forward_failed.inc();
                debug!("Forwarding failed: {}", e);
            }
        });
    }

    // Wait for in-flight requests
    let _ = permits.acquire_many(workers as u32).await;
}

async fn post_event(
    client: &reqwest::Client,
    endpoint: &str,
    event: &Event,
) -> ForwardResult<()> {
    let request_error = |source| ForwardError::Request {
        endpoint: endpoint.to_string(),
        source,
    };

    client
        .post(endpoint)
        .json(event)
        .send()
        .await
        .map_err(request_error)?
        .error_for_status()
        .map_err(request_error)?;
    Ok(())
}
