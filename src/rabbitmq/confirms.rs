// src/rabbitmq/confirms.rs
// In-flight publishes of one confirm-mode channel, keyed by delivery tag.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::rabbitmq::transport::ChannelEvent;

/// What eventually happened to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Acked,
    Nacked,
    Returned { reply_code: u16, reply_text: String },
    Lost(String),
    Closed,
}

struct Pending {
    // None for publishes nobody waits on; the entry still has to be consumed
    // so tags stay aligned with the broker.
    waiter: Option<oneshot::Sender<ConfirmOutcome>>,
}

struct Inner {
    next_tag: u64,
    pending: BTreeMap<u64, Pending>,
    returned: HashMap<u64, (u16, String)>,
    failed: Option<ConfirmOutcome>,
}

pub struct ConfirmTracker {
    inner: Mutex<Inner>,
    drained: Notify,
}

impl Default for ConfirmTracker {
    fn default() -> Self {
        ConfirmTracker {
            inner: Mutex::new(Inner {
                next_tag: 1,
                pending: BTreeMap::new(),
                returned: HashMap::new(),
                failed: None,
            }),
            drained: Notify::new(),
        }
    }
}

impl ConfirmTracker {
    /// Reserves the tag the broker will assign to the next publish. Must be
    /// called under the channel's write lock, right before sending.
    pub(crate) fn reserve(
        &self,
        wait: bool,
    ) -> Result<(u64, Option<oneshot::Receiver<ConfirmOutcome>>), ConfirmOutcome> {
        let mut inner = self.inner.lock();
        if let Some(failure) = &inner.failed {
            return Err(failure.clone());
        }
        let tag = inner.next_tag;
        inner.next_tag += 1;

        let (waiter, receiver) = if wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        inner.pending.insert(tag, Pending { waiter });
        trace!(delivery_tag = tag, "Reserved delivery tag");
        Ok((tag, receiver))
    }

    /// Gives back a reservation whose publish never reached the broker.
    pub(crate) fn abandon(&self, tag: u64) {
        let mut inner = self.inner.lock();
        inner.pending.remove(&tag);
        if inner.next_tag == tag + 1 {
            inner.next_tag = tag;
        }
        if inner.pending.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once no publish is waiting for a confirm.
    pub(crate) async fn wait_drained(&self) {
        loop {
            let drained = self.drained.notified();
            if self.pending() == 0 {
                return;
            }
            drained.await;
        }
    }

    pub(crate) fn handle(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Ack { delivery_tag, multiple } => {
                self.settle(*delivery_tag, *multiple, true)
            }
            ChannelEvent::Nack { delivery_tag, multiple } => {
                self.settle(*delivery_tag, *multiple, false)
            }
            ChannelEvent::Returned {
                delivery_tag,
                reply_code,
                reply_text,
            } => {
                let mut inner = self.inner.lock();
                if inner.pending.contains_key(delivery_tag) {
                    inner
                        .returned
                        .insert(*delivery_tag, (*reply_code, reply_text.clone()));
                } else {
                    warn!(delivery_tag, "Returned message for an unknown delivery tag");
                }
            }
            ChannelEvent::Closed { reason } => self.fail_all(ConfirmOutcome::Lost(reason.clone())),
        }
    }

    fn settle(&self, delivery_tag: u64, multiple: bool, ack: bool) {
        let mut inner = self.inner.lock();
        let tags: Vec<u64> = if multiple {
            inner.pending.range(..=delivery_tag).map(|(tag, _)| *tag).collect()
        } else {
            vec![delivery_tag]
        };

        for tag in tags {
            let Some(pending) = inner.pending.remove(&tag) else {
                debug!(delivery_tag = tag, "Confirm for a tag that is not pending");
                continue;
            };
            let returned = inner.returned.remove(&tag);
            let outcome = match (ack, returned) {
                (true, Some((reply_code, reply_text))) => ConfirmOutcome::Returned {
                    reply_code,
                    reply_text,
                },
                (true, None) => ConfirmOutcome::Acked,
                (false, _) => ConfirmOutcome::Nacked,
            };
            if let Some(waiter) = pending.waiter {
                let _ = waiter.send(outcome);
            }
        }
        if inner.pending.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Fails every pending publish, and every later reservation, with `outcome`.
    pub(crate) fn fail_all(&self, outcome: ConfirmOutcome) {
        let mut inner = self.inner.lock();
        if inner.failed.is_none() {
            inner.failed = Some(outcome.clone());
        }
        let pending = std::mem::take(&mut inner.pending);
        inner.returned.clear();
        drop(inner);
        self.drained.notify_waiters();

        if !pending.is_empty() {
            debug!(count = pending.len(), outcome = ?outcome, "Failing pending publishes");
        }
        for (_, entry) in pending {
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
