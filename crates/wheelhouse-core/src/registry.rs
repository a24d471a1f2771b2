//! Channel registry and subscription lifecycle.
//!
//! Each attached session owns exactly one pump task holding one broadcast
//! receiver, forwarding every event whose channel is in the session's name
//! set into the adapter's event queue. A single receiver per session means
//! events keep bus order end to end, including across an identity migration
//! and between a final result and the completion signal. Migration adds the
//! replacement channel names to the set; nothing is removed until the
//! session closes, so the original channels stay live for re-emission.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::transport::{ChannelBus, ChannelKind};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} is already attached")]
    AlreadyAttached(String),
    #[error("session {0} is not attached")]
    NotAttached(String),
    #[error("failed to open channels for session {0}")]
    OpenFailed(String),
}

/// An event pumped off the bus for one attached session.
#[derive(Debug, Clone)]
pub struct PumpEvent {
    /// The client-side key the session was attached under. Stable across
    /// identity migrations.
    pub client_id: String,
    pub kind: ChannelKind,
    pub payload: String,
}

/// One session's subscription: the channel names its pump forwards, and the
/// pump task itself. The set only grows (replacement channels on migration)
/// until the session closes and the task is aborted.
struct SubscriptionSet {
    channels: Arc<Mutex<HashSet<String>>>,
    pump: JoinHandle<()>,
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn channel_names(session_id: &str) -> HashSet<String> {
    [
        ChannelKind::Message,
        ChannelKind::IdentityUpdate,
        ChannelKind::Completion,
    ]
    .iter()
    .map(|kind| kind.channel_name(session_id))
    .collect()
}

/// Registry of per-session channel subscriptions.
pub struct ChannelRegistry {
    bus: Arc<ChannelBus>,
    events: mpsc::UnboundedSender<PumpEvent>,
    sessions: HashMap<String, SubscriptionSet>,
}

impl ChannelRegistry {
    pub fn new(bus: Arc<ChannelBus>) -> (Self, mpsc::UnboundedReceiver<PumpEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                bus,
                events,
                sessions: HashMap::new(),
            },
            rx,
        )
    }

    pub fn is_attached(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Attach a session: open message, identity-update and completion
    /// subscriptions for `session_id`, delivering under `client_id`.
    pub async fn attach(&mut self, client_id: &str, session_id: &str) -> Result<(), RegistryError> {
        if self.sessions.contains_key(client_id) {
            return Err(RegistryError::AlreadyAttached(client_id.to_string()));
        }

        let channels = Arc::new(Mutex::new(channel_names(session_id)));
        let (pump, ready) = self.spawn_pump(client_id, channels.clone());
        if ready.await.is_err() {
            pump.abort();
            return Err(RegistryError::OpenFailed(session_id.to_string()));
        }

        self.sessions
            .insert(client_id.to_string(), SubscriptionSet { channels, pump });
        log::info!("attached session {} as {}", session_id, client_id);
        Ok(())
    }

    /// Open replacement channels for a migrated session identity.
    ///
    /// The replacement names join the session's existing set, so the pump
    /// that already carries the original channels forwards the new ones too,
    /// in bus order. By the time this returns the replacement channels are
    /// live; the originals stay until the session closes.
    pub fn open_replacement(
        &mut self,
        client_id: &str,
        new_session_id: &str,
    ) -> Result<(), RegistryError> {
        let set = self
            .sessions
            .get(client_id)
            .ok_or_else(|| RegistryError::NotAttached(client_id.to_string()))?;

        let mut channels = set
            .channels
            .lock()
            .map_err(|_| RegistryError::OpenFailed(new_session_id.to_string()))?;
        channels.extend(channel_names(new_session_id));
        drop(channels);

        log::info!(
            "opened replacement channels for {} under session {}",
            client_id,
            new_session_id
        );
        Ok(())
    }

    /// Close a session and abort its pump task, original and replacement
    /// channels alike. Idempotent.
    pub fn close(&mut self, client_id: &str) {
        if let Some(set) = self.sessions.remove(client_id) {
            drop(set);
            log::info!("closed channels for session {}", client_id);
        }
    }

    fn spawn_pump(
        &self,
        client_id: &str,
        channels: Arc<Mutex<HashSet<String>>>,
    ) -> (JoinHandle<()>, oneshot::Receiver<()>) {
        let client_id = client_id.to_string();
        let events = self.events.clone();
        // Subscribe before spawning so no event between open and task start
        // is missed.
        let mut rx = self.bus.subscribe();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let _ = ready_tx.send(());
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let wanted = channels
                            .lock()
                            .map(|names| names.contains(&event.channel))
                            .unwrap_or(false);
                        if !wanted {
                            continue;
                        }
                        let Some(kind) = ChannelKind::from_channel(&event.channel) else {
                            continue;
                        };
                        let forwarded = events.send(PumpEvent {
                            client_id: client_id.clone(),
                            kind,
                            payload: event.payload,
                        });
                        if forwarded.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("pump for {} lagged, {} events missed", client_id, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        (handle, ready_rx)
    }
}
