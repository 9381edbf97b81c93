use flume::TrySendError;
use reqwest::header::CONTENT_TYPE;
use tokio_util::sync::CancellationToken;
use crate::config::BroadcastConfig;

/// One outbound fire-and-forget POST
#[derive(Debug, Clone)]
pub struct PushJob {
    pub url: String,
    pub body: String,
}

/// Build `http://<address><path>` unless the address already carries a scheme
pub fn node_url(address: &str, path: &str) -> String {
    let base = address.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{}{}", base, path)
    } else {
        format!("http://{}{}", base, path)
    }
}

/// Bounded push queue with drop-oldest overflow.
///
/// Holding a receiver next to the sender lets a full queue evict its
/// oldest job so the newest one is kept.
#[derive(Clone)]
pub struct PushQueue {
    tx: flume::Sender<PushJob>,
    overflow: flume::Receiver<PushJob>,
}

impl PushQueue {
    pub fn new(capacity: usize) -> (Self, flume::Receiver<PushJob>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (
            Self {
                tx,
                overflow: rx.clone(),
            },
            rx,
        )
    }

    /// Queue a job. Returns false only if it could not be queued at all.
    pub fn push(&self, job: PushJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                if let Ok(dropped) = self.overflow.try_recv() {
                    tracing::warn!("Push queue full, dropped oldest push to {}", dropped.url);
                }
                match self.tx.try_send(job) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("Push queue full, dropped push to {}", e.into_inner().url);
                        false
                    }
                }
            }
            Err(TrySendError::Disconnected(job)) => {
                tracing::warn!("Push queue closed, dropped push to {}", job.url);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Fixed pool of workers draining a [`PushQueue`].
/// Delivery is at-most-once: failures are logged and never retried.
#[derive(Clone)]
pub struct Pusher {
    queue: PushQueue,
}

impl Pusher {
    pub fn spawn(config: &BroadcastConfig, cancel: CancellationToken) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.push_timeout())
            .build()
            .unwrap_or_default();
        let (queue, rx) = PushQueue::new(config.queue_capacity);

        for worker in 0..config.workers.max(1) {
            let rx = rx.clone();
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        job = rx.recv_async() => match job {
                            Ok(job) => deliver(&client, job).await,
                            Err(_) => break,
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
                tracing::debug!("Push worker {} stopped", worker);
            });
        }

        Self { queue }
    }

    pub fn push(&self, job: PushJob) -> bool {
        self.queue.push(job)
    }

    pub fn queue(&self) -> &PushQueue {
        &self.queue
    }
}

async fn deliver(client: &reqwest::Client, job: PushJob) {
    let result = client
        .post(&job.url)
        .header(CONTENT_TYPE, "application/json")
        .body(job.body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            tracing::trace!("Pushed to {}", job.url);
        }
        Ok(resp) => {
            tracing::warn!("Push to {} answered {}", job.url, resp.status());
        }
        Err(e) => {
            tracing::warn!("Push to {} failed: {}", job.url, e);
        }
    }
}
