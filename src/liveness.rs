use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, Duration, Instant};

use crate::events::LinkEvent;

/// How many image frames have arrived this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTally {
    NeverSeen,
    SeenOnce { at: Instant },
    Streaming { count: u64 },
}

/// What a single image arrival meant to the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// First frame of the session; not yet proof of a live stream
    First,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Offline,
    Alive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    /// A single frame arrived and nothing followed it
    SingleStaleFrame { silent_for: Duration },
    /// Data was flowing and then stopped
    WentSilent { silent_for: Duration },
}

/// Tracks arrival recency across all channels of one session
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    tally: FrameTally,
    last_live_at: Option<Instant>,
    silence_threshold: Duration,
    check_interval: Duration,
    checking: bool,
}

impl LivenessMonitor {
    pub fn new(silence_threshold: Duration, check_interval: Duration) -> Self {
        LivenessMonitor {
            tally: FrameTally::NeverSeen,
            last_live_at: None,
            silence_threshold,
            check_interval,
            checking: false,
        }
    }

    /// (Re)start periodic checks. The last alive mark is forgotten but the frame tally is
    /// kept, so a lone frame seen before checks began still goes stale.
    pub fn arm(&mut self) {
        self.last_live_at = None;
        self.checking = true;
    }

    /// Stop periodic checks; the last alive mark is forgotten
    pub fn halt(&mut self) {
        self.checking = false;
        self.last_live_at = None;
    }

    pub fn is_checking(&self) -> bool {
        self.checking
    }

    /// Record an image frame arrival on any stream
    pub fn on_frame(&mut self, now: Instant) -> Arrival {
        match self.tally {
            FrameTally::NeverSeen => {
                self.tally = FrameTally::SeenOnce { at: now };
                Arrival::First
            }
            FrameTally::SeenOnce { .. } => {
                self.tally = FrameTally::Streaming { count: 2 };
                self.mark_live(now);
                Arrival::Live
            }
            FrameTally::Streaming { count } => {
                self.tally = FrameTally::Streaming { count: count + 1 };
                self.mark_live(now);
                Arrival::Live
            }
        }
    }

    pub fn mark_live(&mut self, now: Instant) {
        self.last_live_at = Some(now);
    }

    /// Periodic evaluation. `Some` means the agent should be treated as offline.
    pub fn check(&self, now: Instant) -> Option<OfflineReason> {
        if !self.checking {
            return None;
        }

        if let FrameTally::SeenOnce { at } = self.tally {
            let silent_for = now.saturating_duration_since(at);
            if silent_for > self.silence_threshold {
                return Some(OfflineReason::SingleStaleFrame { silent_for });
            }
        }

        if let Some(last) = self.last_live_at {
            let silent_for = now.saturating_duration_since(last);
            if silent_for > self.silence_threshold {
                return Some(OfflineReason::WentSilent { silent_for });
            }
        }

        None
    }

    /// Derived view for the UI
    pub fn state(&self, now: Instant) -> LinkState {
        match self.last_live_at {
            Some(last) if now.saturating_duration_since(last) <= self.silence_threshold => {
                LinkState::Alive
            }
            _ => LinkState::Offline,
        }
    }

    pub fn frame_count(&self) -> u64 {
        match self.tally {
            FrameTally::NeverSeen => 0,
            FrameTally::SeenOnce { .. } => 1,
            FrameTally::Streaming { count } => count,
        }
    }

    pub fn tally(&self) -> FrameTally {
        self.tally
    }

    pub fn last_live_at(&self) -> Option<Instant> {
        self.last_live_at
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }
}

/// Periodic tick source for one session. Ends when the event queue closes.
pub async fn liveness_ticker(events: UnboundedSender<LinkEvent>, epoch: u64, every: Duration) {
    loop {
        sleep(every).await;
        if events.send(LinkEvent::LivenessTick { epoch }).is_err() {
            break;
        }
    }
}
