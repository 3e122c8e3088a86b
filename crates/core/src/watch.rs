//! Watch events and the cancellable watch stream handle.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Resource, ResourceKey, Revision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Error,
}

/// One change observed on a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<S = serde_json::Value> {
    Added(Resource<S>),
    /// `previous` is absent only when the backend could not observe it
    /// (a resumed Kubernetes watch whose first event is a modification).
    Modified { previous: Option<Resource<S>>, object: Resource<S> },
    /// `revision` is the revision of the deletion itself.
    Deleted { previous: Resource<S>, revision: Revision },
    Error(Error),
}

impl<S> WatchEvent<S> {
    pub fn event_type(&self) -> WatchEventType {
        match self {
            Self::Added(_) => WatchEventType::Added,
            Self::Modified { .. } => WatchEventType::Modified,
            Self::Deleted { .. } => WatchEventType::Deleted,
            Self::Error(_) => WatchEventType::Error,
        }
    }

    /// New state; absent for deletions and errors.
    pub fn object(&self) -> Option<&Resource<S>> {
        match self {
            Self::Added(o) | Self::Modified { object: o, .. } => Some(o),
            _ => None,
        }
    }

    pub fn previous(&self) -> Option<&Resource<S>> {
        match self {
            Self::Modified { previous, .. } => previous.as_ref(),
            Self::Deleted { previous, .. } => Some(previous),
            _ => None,
        }
    }

    pub fn revision(&self) -> Option<&Revision> {
        match self {
            Self::Added(o) | Self::Modified { object: o, .. } => o.revision(),
            Self::Deleted { revision, .. } => Some(revision),
            Self::Error(_) => None,
        }
    }

    pub fn key(&self) -> Option<ResourceKey> {
        self.object().or_else(|| self.previous()).map(|r| r.key())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Convert every carried resource; the first failure is returned.
    pub fn try_map<T>(self, mut f: impl FnMut(Resource<S>) -> Result<Resource<T>, Error>) -> Result<WatchEvent<T>, Error> {
        Ok(match self {
            Self::Added(o) => WatchEvent::Added(f(o)?),
            Self::Modified { previous, object } => WatchEvent::Modified { previous: previous.map(&mut f).transpose()?, object: f(object)? },
            Self::Deleted { previous, revision } => WatchEvent::Deleted { previous: f(previous)?, revision },
            Self::Error(e) => WatchEvent::Error(e),
        })
    }
}

/// Producer half of a watch stream, held by the task feeding events.
#[derive(Debug)]
pub struct WatchSender<S = serde_json::Value> {
    tx: mpsc::Sender<WatchEvent<S>>,
    cancel: CancellationToken,
}

impl<S> Clone for WatchSender<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), cancel: self.cancel.clone() }
    }
}

impl<S: Send> WatchSender<S> {
    /// Deliver one event. Returns false once the consumer stopped or dropped
    /// the stream; the producer should then exit.
    pub async fn send(&self, ev: WatchEvent<S>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.tx.send(ev) => res.is_ok(),
        }
    }

    /// Resolves when the consumer stops the stream.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

/// Consumer half: a single-producer event channel over one kind.
///
/// After an `Error` event the stream yields `None`. `stop` is idempotent and
/// dropping the stream stops it.
#[derive(Debug)]
pub struct WatchStream<S = serde_json::Value> {
    rx: mpsc::Receiver<WatchEvent<S>>,
    cancel: CancellationToken,
    done: bool,
}

impl<S> WatchStream<S> {
    /// Create a connected sender/stream pair with the given buffer.
    pub fn channel(buffer: usize) -> (WatchSender<S>, WatchStream<S>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        (WatchSender { tx, cancel: cancel.clone() }, WatchStream { rx, cancel, done: false })
    }

    /// Next event, or `None` once stopped, errored or closed by the producer.
    pub async fn next(&mut self) -> Option<WatchEvent<S>> {
        if self.done {
            return None;
        }
        let ev = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            ev = self.rx.recv() => ev,
        };
        match &ev {
            None => self.done = true,
            Some(WatchEvent::Error(_)) => self.finish(),
            Some(_) => {}
        }
        ev
    }

    pub fn stop(&mut self) {
        if !self.done {
            tracing::trace!("watch stream stopped");
        }
        self.finish();
    }

    pub fn is_stopped(&self) -> bool {
        self.done
    }

    /// Token cancelled when this stream stops; lets wrappers chain their own
    /// producers onto it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn finish(&mut self) {
        self.done = true;
        self.cancel.cancel();
        self.rx.close();
    }
}

impl<S> Drop for WatchStream<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
