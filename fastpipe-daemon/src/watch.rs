//! File-event wake-ups for the dispatch loop.
//!
//! The loop still rescans on a timer; events only shorten the idle wait.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

pub(crate) struct RequestWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<()>,
}

impl RequestWatcher {
    pub(crate) fn new(dir: &Path) -> notify::Result<Self> {
        let (tx, events) = mpsc::channel::<()>();
        let mut watcher = recommended_watcher(move |event: notify::Result<Event>| match event {
            Ok(event) if is_relevant_event_kind(&event.kind) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "request watcher event error"),
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    /// Block for up to `timeout`. Returns `true` if a file event arrived.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        match self.events.recv_timeout(timeout) {
            Ok(()) => {
                while self.events.try_recv().is_ok() {}
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};

    #[test]
    fn renames_and_creates_wake_the_loop() {
        assert!(is_relevant_event_kind(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant_event_kind(&EventKind::Modify(ModifyKind::Name(
            RenameMode::To
        ))));
        assert!(!is_relevant_event_kind(&EventKind::Remove(RemoveKind::File)));
    }
}
