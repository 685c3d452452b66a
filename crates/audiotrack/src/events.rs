//! Track events and the per-track dispatcher thread.
//!
//! The device callback never runs user code and never drops heavy values.
//! Instead it posts a [`Notice`] with `try_send`; the dispatcher thread runs
//! `on_end` handlers, releases retired sources and republishes what happened
//! as public [`TrackEvent`]s.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use audiotrack_core::{Error, PcmBuffer, Repeat, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, trace, warn};

use crate::audiofile::AudioFile;
use crate::control::TrackState;
use crate::source::{AudioSource, RepeatCounter};

/// Capacity of the callback -> dispatcher channel.
pub(crate) const NOTICE_CAPACITY: usize = 256;

/// Public events kept for the caller before the oldest are discarded.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Events reported by a track.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    /// Playback state changed.
    StateChanged(TrackState),
    /// A file started playing from its first frame.
    FileStarted(PathBuf),
    /// A file finished a pass and is replaying; `repeat_left` replays follow.
    FileEnded { path: PathBuf, repeat_left: Repeat },
    /// A file finished its last pass and the track stopped.
    PlaybackFinished(PathBuf),
    /// Error raised away from the caller's thread.
    Error(String),
}

/// Messages from the device callback and feeder threads to the dispatcher.
pub(crate) enum Notice {
    /// A pass ended and the source is rewinding.
    FileEnded {
        file: Arc<AudioFile>,
        repeat: Arc<RepeatCounter>,
        repeat_left: Repeat,
    },
    /// The last pass ended; the track is now stopped.
    Finished { file: Arc<AudioFile> },
    /// A source the callback no longer needs.
    Retired(AudioSource),
    /// A queued block the callback has fully played.
    Released(PcmBuffer),
    Error(Error),
}

/// Bounded public event queue that discards the oldest event when full.
pub(crate) struct EventQueue {
    tx: Sender<TrackEvent>,
    rx: Receiver<TrackEvent>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    pub fn emit(&self, mut event: TrackEvent) {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.rx.try_recv();
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn try_recv(&self) -> Option<TrackEvent> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<TrackEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Handles notices for one track.
pub(crate) struct Dispatcher {
    track: String,
    events: Arc<EventQueue>,
}

impl Dispatcher {
    pub fn new(track: impl Into<String>, events: Arc<EventQueue>) -> Self {
        Self {
            track: track.into(),
            events,
        }
    }

    /// Run on a dedicated thread until every notice sender is gone.
    pub fn spawn(self, notices: Receiver<Notice>) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("audiotrack-events-{}", self.track))
            .spawn(move || {
                debug!("Event dispatcher for '{}' started", self.track);
                for notice in notices {
                    self.handle(notice);
                }
                debug!("Event dispatcher for '{}' finished", self.track);
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn event thread: {e}")))
    }

    pub fn handle(&self, notice: Notice) {
        match notice {
            Notice::FileEnded {
                file,
                repeat,
                repeat_left,
            } => {
                info!(
                    "'{}': {} ended, repeat left: {repeat_left}",
                    self.track,
                    file.original_path().display()
                );
                if let Some(updated) = file.notify_end(repeat_left) {
                    debug!("'{}': on_end set repeat to {updated}", self.track);
                    repeat.set(updated);
                }
                repeat.settle();
                self.events.emit(TrackEvent::FileEnded {
                    path: file.original_path().to_path_buf(),
                    repeat_left,
                });
            }
            Notice::Finished { file } => {
                info!(
                    "'{}': finished playing {}",
                    self.track,
                    file.original_path().display()
                );
                self.events
                    .emit(TrackEvent::PlaybackFinished(file.original_path().to_path_buf()));
                self.events
                    .emit(TrackEvent::StateChanged(TrackState::Stopped));
            }
            Notice::Retired(source) => {
                trace!("'{}': releasing retired source", self.track);
                drop(source);
            }
            Notice::Released(buffer) => drop(buffer),
            Notice::Error(err) => {
                if err.is_fatal() {
                    error!("'{}': {err}, the stream cannot continue", self.track);
                } else if err.is_source_error() {
                    warn!("'{}': bad source material: {err}", self.track);
                } else {
                    error!("'{}': {err}", self.track);
                }
                self.events.emit(TrackEvent::Error(err.to_string()));
            }
        }
    }
}

/// Post a notice without blocking. A full channel drops the notice, which
/// for `Retired`/`Released` just means the value is freed on the caller.
/// Returns `false` if the notice was dropped.
pub(crate) fn post(notices: &Sender<Notice>, notice: Notice) -> bool {
    notices.try_send(notice).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_queue_drops_oldest() {
        let queue = EventQueue::new(2);
        queue.emit(TrackEvent::Error("a".into()));
        queue.emit(TrackEvent::Error("b".into()));
        queue.emit(TrackEvent::Error("c".into()));

        assert_eq!(queue.try_recv(), Some(TrackEvent::Error("b".into())));
        assert_eq!(queue.try_recv(), Some(TrackEvent::Error("c".into())));
        assert_eq!(queue.try_recv(), None);
    }

    #[test]
    fn test_file_ended_runs_on_end() {
        let events = Arc::new(EventQueue::new(8));
        let dispatcher = Dispatcher::new("sfx", events.clone());

        let file = Arc::new(
            AudioFile::new("vine_boom.wav")
                .with_repeat(1)
                .with_on_end(|_, left| Some(left.incremented())),
        );
        let repeat = Arc::new(RepeatCounter::new(Repeat::Times(0)));

        dispatcher.handle(Notice::FileEnded {
            file,
            repeat: repeat.clone(),
            repeat_left: Repeat::Times(0),
        });

        assert_eq!(repeat.get(), Repeat::Times(1));
        assert_eq!(
            events.try_recv(),
            Some(TrackEvent::FileEnded {
                path: PathBuf::from("vine_boom.wav"),
                repeat_left: Repeat::Times(0),
            })
        );
    }

    #[test]
    fn test_errors_are_published() {
        let events = Arc::new(EventQueue::new(8));
        let dispatcher = Dispatcher::new("bass", events.clone());
        dispatcher.handle(Notice::Error(Error::Decode("bad packet".into())));

        assert_eq!(
            events.try_recv(),
            Some(TrackEvent::Error("Audio decode error: bad packet".into()))
        );
    }

    #[test]
    fn test_dispatcher_thread_exits_with_senders() {
        let events = Arc::new(EventQueue::new(8));
        let (tx, rx) = bounded(NOTICE_CAPACITY);
        let handle = Dispatcher::new("drums", events.clone()).spawn(rx).unwrap();

        post(&tx, Notice::Error(Error::Internal("x".into())));
        drop(tx);
        handle.join().unwrap();

        assert!(matches!(events.try_recv(), Some(TrackEvent::Error(_))));
    }
}
