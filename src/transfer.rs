//! Binding of the multi-transfer HTTP engine onto the event-loop runtime.
//!
//! The engine owns one [`reqwest::Client`] and the set of in-flight
//! transfers, each mapped back to the wrapper that started it. Socket
//! readiness and engine timeouts are registered with the same runtime the
//! event-loop thread drives, so all network activity stays on that thread;
//! finished transfers post a [`Completion`] on a notification queue the loop
//! drains after every wakeup.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;

use crate::{vfile::Inner, TransferId};

/// How long a transfer may take to connect before the engine gives up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Posted by a transfer task when its transfer finishes, success or not.
pub(crate) struct Completion {
    pub id: TransferId,
    /// Effective URL after redirects; the request URL when the transfer
    /// never got far enough to know better.
    pub effective_url: String,
    pub result: Result<(), reqwest::Error>,
}

/// The multi-transfer engine.
pub(crate) struct Multi {
    client: reqwest::Client,
    next_id: TransferId,
    in_flight: HashMap<TransferId, InFlight>,
    done_tx: UnboundedSender<Completion>,
}

struct InFlight {
    file: Arc<Inner>,
    task: tokio::task::JoinHandle<()>,
}

impl Multi {
    pub fn new(done_tx: UnboundedSender<Completion>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Multi {
            client,
            next_id: 0,
            in_flight: HashMap::new(),
            done_tx,
        })
    }

    /// Starts a transfer for `url`, associating it with `file`. Runs on the
    /// event-loop thread; the body streams into the wrapper's cache buffer
    /// as chunks arrive.
    pub fn add(&mut self, url: url::Url, file: Arc<Inner>) -> TransferId {
        let id = self.next_id;
        self.next_id += 1;

        let client = self.client.clone();
        let done_tx = self.done_tx.clone();
        let task_file = file.clone();
        let task = tokio::task::spawn_local(async move {
            let mut effective_url = url.to_string();
            let result = fetch(&client, url, &task_file, &mut effective_url).await;
            if let Err(e) = &result {
                log::warn!("transfer {} failed: {}", id, e);
            }
            let _ = done_tx.send(Completion {
                id,
                effective_url,
                result,
            });
        });

        self.in_flight.insert(id, InFlight { file, task });
        id
    }

    /// Removes a finished transfer, returning the wrapper it belonged to.
    pub fn remove(&mut self, id: TransferId) -> Option<Arc<Inner>> {
        self.in_flight.remove(&id).map(|t| t.file)
    }

    /// Tears down every outstanding transfer. Called at loop shutdown.
    pub fn abort_all(&mut self) {
        for (id, transfer) in self.in_flight.drain() {
            log::debug!(
                "aborting transfer {} of {:?} at shutdown",
                id,
                transfer.file.name
            );
            transfer.task.abort();
        }
    }
}

/// Drives one transfer to completion.
///
/// The completion is uniform: a non-2xx status is not distinguished from
/// success, and whatever body the origin sent is retained.
async fn fetch(
    client: &reqwest::Client,
    url: url::Url,
    file: &Arc<Inner>,
    effective_url: &mut String,
) -> Result<(), reqwest::Error> {
    let resp = client.get(url).send().await?;
    *effective_url = resp.url().to_string();

    file.begin_download(resp.content_length());
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        file.append_download(&chunk?);
    }
    Ok(())
}
