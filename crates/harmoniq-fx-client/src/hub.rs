//! Fan-out of engine notifications to every attachment of an instance.
//!
//! Publishing only resolves the recipients and enqueues them; a single
//! dispatcher thread performs the actual deliveries. Events of one instance
//! therefore reach subscribers in publish order, and no sink ever runs while
//! the hub (or the publisher) holds a lock.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::{EffectError, EffectResult};
use crate::event::EngineEvent;
use crate::ids::{AttachmentId, EngineIdentity, InstanceId};

pub const DISPATCHER_THREAD_NAME: &str = "fx-notify";

/// Dead instances remembered for rejecting late subscriptions and repeated
/// death reports. Instance ids are never reused.
const DEAD_INSTANCE_HISTORY: usize = 256;

/// Receiving end of engine notifications for one attachment.
pub trait EventSink: Send + Sync {
    fn deliver(&self, identity: &EngineIdentity, event: &EngineEvent);
}

/// Which subscribers of an instance an event is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    All,
    Only(AttachmentId),
    AllExcept(AttachmentId),
}

impl Recipients {
    pub fn includes(&self, attachment: AttachmentId) -> bool {
        match self {
            Recipients::All => true,
            Recipients::Only(id) => *id == attachment,
            Recipients::AllExcept(id) => *id != attachment,
        }
    }
}

struct Subscriber {
    attachment: AttachmentId,
    sink: Weak<dyn EventSink>,
}

struct InstanceEntry {
    identity: EngineIdentity,
    subscribers: Vec<Subscriber>,
}

#[derive(Default)]
struct Registry {
    instances: HashMap<InstanceId, InstanceEntry>,
    by_attachment: HashMap<AttachmentId, InstanceId>,
    dead: VecDeque<InstanceId>,
}

impl Registry {
    fn is_dead(&self, instance: InstanceId) -> bool {
        self.dead.contains(&instance)
    }

    /// Returns `false` if `instance` was already marked dead.
    fn bury(&mut self, instance: InstanceId) -> bool {
        if self.is_dead(instance) {
            return false;
        }
        if self.dead.len() == DEAD_INSTANCE_HISTORY {
            self.dead.pop_front();
        }
        self.dead.push_back(instance);
        true
    }
}

enum Dispatch {
    Deliver {
        sink: Weak<dyn EventSink>,
        identity: EngineIdentity,
        event: EngineEvent,
    },
    Flush(Sender<()>),
    Shutdown,
}

pub struct NotificationHub {
    registry: Mutex<Registry>,
    queue: Sender<Dispatch>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_id: ThreadId,
}

impl NotificationHub {
    /// Create a hub together with its dispatcher thread.
    pub fn start() -> EffectResult<Arc<Self>> {
        let (queue, rx) = unbounded();
        let handle = thread::Builder::new()
            .name(DISPATCHER_THREAD_NAME.into())
            .spawn(move || dispatch_loop(rx))
            .map_err(|err| {
                EffectError::unavailable(format!("failed to spawn notification dispatcher: {err}"))
            })?;
        Ok(Arc::new(Self {
            registry: Mutex::new(Registry::default()),
            queue,
            dispatcher_id: handle.thread().id(),
            dispatcher: Mutex::new(Some(handle)),
        }))
    }

    pub fn subscribe(
        &self,
        identity: EngineIdentity,
        attachment: AttachmentId,
        sink: Weak<dyn EventSink>,
    ) -> EffectResult<()> {
        let mut registry = self.registry.lock();
        if registry.is_dead(identity.instance) {
            return Err(EffectError::DeadObject);
        }
        registry
            .instances
            .entry(identity.instance)
            .or_insert_with(|| InstanceEntry {
                identity,
                subscribers: Vec::new(),
            })
            .subscribers
            .push(Subscriber { attachment, sink });
        registry.by_attachment.insert(attachment, identity.instance);
        debug!(instance = %identity.instance, %attachment, "subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, attachment: AttachmentId) {
        let mut registry = self.registry.lock();
        let Some(instance) = registry.by_attachment.remove(&attachment) else {
            return;
        };
        let now_empty = match registry.instances.get_mut(&instance) {
            Some(entry) => {
                entry.subscribers.retain(|s| s.attachment != attachment);
                entry.subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            registry.instances.remove(&instance);
        }
        debug!(%instance, %attachment, "unsubscribed");
    }

    /// Queue `event` for the selected subscribers of `instance`. Returns the
    /// number of deliveries queued.
    pub fn publish(
        &self,
        instance: InstanceId,
        recipients: Recipients,
        event: EngineEvent,
    ) -> usize {
        let registry = self.registry.lock();
        let Some(entry) = registry.instances.get(&instance) else {
            trace!(%instance, ?event, "no subscribers");
            return 0;
        };
        let mut queued = 0;
        for subscriber in &entry.subscribers {
            if !recipients.includes(subscriber.attachment) {
                continue;
            }
            self.enqueue(Dispatch::Deliver {
                sink: subscriber.sink.clone(),
                identity: entry.identity,
                event: event.clone(),
            });
            queued += 1;
        }
        trace!(%instance, ?event, queued, "published");
        queued
    }

    /// Mark `instance` as gone and queue one `DEAD_OBJECT` error to each of
    /// its subscribers. Returns `false` if the instance was already dead.
    pub fn engine_died(&self, instance: InstanceId) -> bool {
        let mut registry = self.registry.lock();
        if !registry.bury(instance) {
            return false;
        }
        let Some(entry) = registry.instances.remove(&instance) else {
            warn!(%instance, "effect engine died with no subscribers");
            return true;
        };
        warn!(%instance, subscribers = entry.subscribers.len(), "effect engine died");
        for subscriber in entry.subscribers {
            registry.by_attachment.remove(&subscriber.attachment);
            self.enqueue(Dispatch::Deliver {
                sink: subscriber.sink,
                identity: entry.identity,
                event: EngineEvent::dead_object(),
            });
        }
        true
    }

    pub fn is_dead(&self, instance: InstanceId) -> bool {
        self.registry.lock().is_dead(instance)
    }

    pub fn subscriber_count(&self, instance: InstanceId) -> usize {
        self.registry
            .lock()
            .instances
            .get(&instance)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// Block until every event published so far has been delivered. Returns
    /// immediately when called from a callback.
    pub fn flush(&self) {
        if thread::current().id() == self.dispatcher_id {
            return;
        }
        let (tx, rx) = bounded(1);
        self.enqueue(Dispatch::Flush(tx));
        let _ = rx.recv();
    }

    fn enqueue(&self, dispatch: Dispatch) {
        if self.queue.send(dispatch).is_err() {
            error!("notification dispatcher is gone");
        }
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        let _ = self.queue.send(Dispatch::Shutdown);
        let handle = self.dispatcher.lock().take();
        if thread::current().id() == self.dispatcher_id {
            return;
        }
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("NotificationHub")
            .field("instances", &registry.instances.len())
            .field("dead", &registry.dead.len())
            .finish()
    }
}

fn dispatch_loop(queue: Receiver<Dispatch>) {
    while let Ok(dispatch) = queue.recv() {
        match dispatch {
            Dispatch::Deliver {
                sink,
                identity,
                event,
            } => {
                let Some(sink) = sink.upgrade() else {
                    continue;
                };
                let delivered =
                    panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(&identity, &event)));
                if delivered.is_err() {
                    error!(instance = %identity.instance, ?event, "effect callback panicked");
                }
            }
            Dispatch::Flush(ack) => {
                let _ = ack.send(());
            }
            Dispatch::Shutdown => break,
        }
    }
}
