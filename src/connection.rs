use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    bundle::ChangeNotification,
    cache::ElementCache,
    element::{split_element_id, FullData, UserId},
    error::CacheError,
};

/// The viewer is not allowed to perform the request.
pub const ERROR_NOT_AUTHORIZED: u32 = 100;
/// The requested change id lies in the future.
pub const ERROR_CHANGE_ID_TOO_HIGH: u32 = 101;
/// The request was syntactically or semantically malformed.
pub const ERROR_WRONG_FORMAT: u32 = 102;

/// One autoupdate frame as sent to a client.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AutoupdatePayload {
    /// Changed elements, restricted for the viewer, grouped by collection.
    pub changed: BTreeMap<String, Vec<FullData>>,
    /// Deleted element ids, grouped by collection.
    pub deleted: BTreeMap<String, Vec<u64>>,
    pub from_change_id: u64,
    pub to_change_id: u64,
    /// `true` when the frame replaces all client state instead of patching
    /// it. Sent when a diff could not be computed anymore.
    pub all_data: bool,
}

/// The transport half of a connection: how frames reach the client. The
/// engine stays transport-agnostic; a websocket (or test) layer implements
/// this.
#[async_trait]
pub trait AutoupdateSink: Send + Sync + 'static {
    async fn send_autoupdate(&self, payload: AutoupdatePayload, in_response: Option<String>);

    async fn send_error(&self, code: u32, message: String, in_response: Option<String>);
}

#[derive(Debug, Default)]
struct ConnectionState {
    /// The change id the client is known to be current up to. `None` until
    /// the first notification or request.
    client_change_id: Option<u64>,
    /// The running coalescing timer, if any.
    pending: Option<JoinHandle<()>>,
}

/// Per-client autoupdate state: tracks what the client has seen, computes
/// diffs on new change ids and coalesces bursts of changes into one frame
/// when a delay is configured.
pub struct AutoupdateConnection {
    cache:   Arc<ElementCache>,
    sink:    Arc<dyn AutoupdateSink>,
    user_id: Option<UserId>,
    delay:   Option<Duration>,
    state:   Mutex<ConnectionState>,
}

impl AutoupdateConnection {
    /// `user_id` is the restriction viewpoint of this connection; `delay` is
    /// the coalescing window (`None` sends every change immediately).
    pub fn new(
        cache: Arc<ElementCache>,
        sink: Arc<dyn AutoupdateSink>,
        user_id: Option<UserId>,
        delay: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            sink,
            user_id,
            delay: delay.filter(|delay| !delay.is_zero()),
            state: Mutex::new(ConnectionState::default()),
        })
    }

    /// Drives the connection from a change notification subscription until
    /// the dispatcher goes away. A lagged receiver is no problem: diffs are
    /// computed from the last change id the client confirmed, so skipped
    /// notifications are covered by the next diff.
    pub fn subscribe(
        self: &Arc<Self>,
        mut notifications: broadcast::Receiver<ChangeNotification>,
    ) -> JoinHandle<()> {
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(notification) => connection.on_new_change_id(notification.change_id).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "connection lagged behind change notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Reacts to a newly committed change id: sends a diff right away, or
    /// arms the coalescing timer. While a timer is armed further
    /// notifications are absorbed by it.
    pub async fn on_new_change_id(self: &Arc<Self>, change_id: u64) {
        let mut state = self.state.lock().await;
        if state.client_change_id.is_none() {
            // First contact: a client connecting now receives the current
            // change as its first diff.
            state.client_change_id = Some(change_id.saturating_sub(1));
        }
        match self.delay {
            None => self.send_pending(&mut state, None).await,
            Some(delay) => {
                if state.pending.as_ref().map_or(true, JoinHandle::is_finished) {
                    let connection = Arc::clone(self);
                    state.pending = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let mut state = connection.state.lock().await;
                        state.pending = None;
                        connection.send_pending(&mut state, None).await;
                    }));
                }
            }
        }
    }

    /// Handles an explicit client request: "give me everything since
    /// `change_id`". Cancels a pending coalescing timer since the answer
    /// covers it.
    pub async fn request_change_id(
        self: &Arc<Self>,
        change_id: u64,
        in_response: Option<String>,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }

        let current = self.cache.current_change_id().await?;
        if change_id == current {
            state.client_change_id = Some(current);
            return Ok(());
        }
        if change_id > current {
            self.sink
                .send_error(
                    ERROR_CHANGE_ID_TOO_HIGH,
                    format!("requested change id {change_id} is higher than the current {current}"),
                    in_response,
                )
                .await;
            return Ok(());
        }

        self.compute_and_send(&mut state, change_id + 1, in_response).await;
        Ok(())
    }

    /// Stops the coalescing timer. Call when the client disconnects.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }

    /// The change id this connection believes the client has, for
    /// introspection.
    pub async fn client_change_id(&self) -> Option<u64> {
        self.state.lock().await.client_change_id
    }

    async fn send_pending(&self, state: &mut ConnectionState, in_response: Option<String>) {
        let from_change_id = state.client_change_id.map_or(0, |change_id| change_id + 1);
        self.compute_and_send(state, from_change_id, in_response).await;
    }

    async fn compute_and_send(
        &self,
        state: &mut ConnectionState,
        from_change_id: u64,
        in_response: Option<String>,
    ) {
        if from_change_id == 0 {
            self.send_full(state, from_change_id, in_response).await;
            return;
        }
        match self.cache.get_data_since(self.user_id, from_change_id).await {
            Ok((to_change_id, changed, deleted_ids)) => {
                state.client_change_id = Some(to_change_id);
                if changed.is_empty() && deleted_ids.is_empty() {
                    // Everything in the window was restricted away; an empty
                    // patch carries no information.
                    return;
                }
                let payload = AutoupdatePayload {
                    changed,
                    deleted: group_deleted(deleted_ids),
                    from_change_id,
                    to_change_id,
                    all_data: false,
                };
                self.sink.send_autoupdate(payload, in_response).await;
            }
            Err(CacheError::ChangeIdTooLow { requested, lowest }) => {
                debug!(requested, lowest, "diff window expired; sending full data");
                self.send_full(state, from_change_id, in_response).await;
            }
            Err(error) => {
                warn!(%error, "autoupdate could not be computed; skipping this round");
            }
        }
    }

    async fn send_full(
        &self,
        state: &mut ConnectionState,
        from_change_id: u64,
        in_response: Option<String>,
    ) {
        match self.cache.get_all_data_with_max_change_id(self.user_id).await {
            Ok((to_change_id, changed)) => {
                state.client_change_id = Some(to_change_id);
                let payload = AutoupdatePayload {
                    changed,
                    deleted: BTreeMap::new(),
                    from_change_id,
                    to_change_id,
                    all_data: true,
                };
                self.sink.send_autoupdate(payload, in_response).await;
            }
            Err(error) => {
                warn!(%error, "full resync could not be computed; skipping this round");
            }
        }
    }
}

impl std::fmt::Debug for AutoupdateConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoupdateConnection")
            .field("user_id", &self.user_id)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

fn group_deleted(deleted_ids: Vec<String>) -> BTreeMap<String, Vec<u64>> {
    let mut deleted: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for element_id in deleted_ids {
        // Ids coming out of the cache are well-formed; anything else was
        // never valid data and is dropped.
        if let Ok((collection, id)) = split_element_id(&element_id) {
            deleted.entry(collection.to_owned()).or_default().push(id);
        }
    }
    for ids in deleted.values_mut() {
        ids.sort_unstable();
    }
    deleted
}
