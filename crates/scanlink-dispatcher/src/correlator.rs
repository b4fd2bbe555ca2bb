//! Single-flight scan correlation.
//!
//! [`Correlator`] is the request side: it sends a tagged command and waits
//! for the answer. [`Mailbox`] is the delivery side fed by the connection
//! manager. They share one slot table holding the outstanding wait and, under
//! [`UnsolicitedPolicy::Retain`], a short backlog of unclaimed payloads.

use crate::error::ScanError;
use parking_lot::Mutex;
use scanlink_core::{Command, Payload, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Unclaimed payloads kept under `Retain`; older ones are evicted.
const MAX_BACKLOG: usize = 4;

/// Where scan commands go. Implemented by the connection manager.
pub trait CommandSink: Send + Sync {
    fn send_command(&self, command: Command) -> impl Future<Output = Result<(), ScanError>> + Send;
}

/// What to do with a payload nobody is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsolicitedPolicy {
    /// Log and drop it.
    #[default]
    Discard,
    /// Queue it and hand it to the next scan request without waiting.
    Retain,
}

impl FromStr for UnsolicitedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discard" => Ok(Self::Discard),
            "retain" => Ok(Self::Retain),
            other => Err(format!("unknown policy {other:?}, expected discard or retain")),
        }
    }
}

type Reply = Result<Vec<u8>, ScanError>;

#[derive(Debug)]
struct Pending {
    id: RequestId,
    reply: oneshot::Sender<Reply>,
}

#[derive(Debug)]
struct Slots {
    policy: UnsolicitedPolicy,
    next_id: u64,
    pending: Option<Pending>,
    backlog: VecDeque<Vec<u8>>,
}

impl Slots {
    /// Whether a result tagged `id` answers the outstanding wait.
    /// Untagged results match whatever is outstanding.
    fn claims(&self, id: Option<RequestId>) -> bool {
        match (&self.pending, id) {
            (Some(pending), Some(id)) => pending.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn unclaimed(&mut self, id: Option<RequestId>, data: Vec<u8>) {
        match self.policy {
            UnsolicitedPolicy::Discard => {
                tracing::warn!(?id, bytes = data.len(), "discarding unsolicited payload");
            }
            UnsolicitedPolicy::Retain => {
                if self.backlog.len() >= MAX_BACKLOG {
                    self.backlog.pop_front();
                    tracing::warn!("backlog full, evicted oldest unsolicited payload");
                }
                tracing::info!(?id, bytes = data.len(), "retaining unsolicited payload");
                self.backlog.push_back(data);
            }
        }
    }
}

/// Delivery side of the correlator.
#[derive(Debug, Clone)]
pub struct Mailbox {
    slots: Arc<Mutex<Slots>>,
}

impl Mailbox {
    pub fn new(policy: UnsolicitedPolicy) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                policy,
                next_id: 0,
                pending: None,
                backlog: VecDeque::new(),
            })),
        }
    }

    pub fn policy(&self) -> UnsolicitedPolicy {
        self.slots.lock().policy
    }

    /// A payload arrived from the device.
    pub fn deliver(&self, payload: Payload) {
        let id = payload.id();
        let mut slots = self.slots.lock();
        if !slots.claims(id) {
            slots.unclaimed(id, payload.into_data());
            return;
        }

        let Some(pending) = slots.pending.take() else {
            return;
        };
        tracing::debug!(id = %pending.id, bytes = payload.len(), "payload matched");
        // The waiter may have just timed out and dropped its receiver.
        if let Err(Ok(data)) = pending.reply.send(Ok(payload.into_data())) {
            slots.unclaimed(id, data);
        }
    }

    /// The device reported that a capture failed.
    pub fn fail(&self, id: Option<RequestId>, message: String) {
        let mut slots = self.slots.lock();
        if !slots.claims(id) {
            tracing::debug!(?id, %message, "capture failure for no outstanding request");
            return;
        }
        if let Some(pending) = slots.pending.take() {
            let _ = pending.reply.send(Err(ScanError::Capture(message)));
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.slots.lock().pending.is_some()
    }

    pub fn backlog_len(&self) -> usize {
        self.slots.lock().backlog.len()
    }

    /// Install a new wait. Also pops a retained payload, if any.
    fn begin(&self) -> Result<Wait<'_>, ScanError> {
        let mut slots = self.slots.lock();
        if slots.pending.is_some() {
            return Err(ScanError::Busy);
        }
        slots.next_id += 1;
        let id = RequestId::new(slots.next_id);
        let (reply, rx) = oneshot::channel();
        slots.pending = Some(Pending { id, reply });
        let stale = slots.backlog.pop_front();
        Ok(Wait {
            mailbox: self,
            id,
            rx,
            stale,
            sent: false,
        })
    }
}

/// One installed wait. Dropping it clears the slot, whether the request
/// finished or its future was cancelled at an await point.
struct Wait<'a> {
    mailbox: &'a Mailbox,
    id: RequestId,
    rx: oneshot::Receiver<Reply>,
    /// Retained payload popped for this request, handed back if the command
    /// never went out.
    stale: Option<Vec<u8>>,
    sent: bool,
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        let mut slots = self.mailbox.slots.lock();
        if slots.pending.as_ref().is_some_and(|p| p.id == self.id) {
            slots.pending = None;
        }
        if !self.sent {
            if let Some(data) = self.stale.take() {
                slots.backlog.push_front(data);
            }
        }
        // Anything delivered but not consumed goes through the policy.
        if let Ok(Ok(data)) = self.rx.try_recv() {
            slots.unclaimed(Some(self.id), data);
        }
    }
}

/// Request side of the correlator.
#[derive(Debug)]
pub struct Correlator<S> {
    sink: S,
    mailbox: Mailbox,
}

impl<S: CommandSink> Correlator<S> {
    pub fn new(sink: S, mailbox: Mailbox) -> Self {
        Self { sink, mailbox }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Ask the device for one image and wait up to `deadline` for it.
    ///
    /// Fails immediately with `Busy` if another request is outstanding, and
    /// with the send error if the command could not be written. A timeout
    /// only ends this wait; the capture on the device is not cancelled.
    pub async fn request_scan(&self, deadline: Duration) -> Result<Vec<u8>, ScanError> {
        let mut wait = self.mailbox.begin()?;
        let id = wait.id;

        self.sink.send_command(Command::scan(id)).await?;
        wait.sent = true;

        if let Some(data) = wait.stale.take() {
            tracing::info!(%id, bytes = data.len(), "answering with retained payload");
            return Ok(data);
        }

        tracing::debug!(%id, ?deadline, "waiting for payload");
        let result = match tokio::time::timeout(deadline, &mut wait.rx).await {
            Ok(Ok(reply)) => reply,
            // The sender stays in the slot table until it answers, and the
            // slot is only cleared by this wait.
            Ok(Err(_)) | Err(_) => Err(ScanError::Timeout(deadline)),
        };
        drop(wait);

        match &result {
            Ok(data) => tracing::info!(%id, bytes = data.len(), "scan complete"),
            Err(e) => tracing::warn!(%id, error = %e, "scan failed"),
        }
        result
    }
}
