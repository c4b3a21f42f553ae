//! Binary frame channel with at-most-one-render-in-flight backpressure.
//!
//! Each accepted frame becomes a [`DisplayResource`] handed to a [`DisplaySurface`]. Until the
//! surface confirms it has presented that resource, further frames are dropped rather than
//! queued. The previously visible resource is released once the new one is confirmed.

use image::ImageFormat;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

use crate::endpoints::StreamKind;
use crate::events::LinkEvent;

/// Renderable handle derived from one frame
#[derive(Debug)]
pub struct DisplayResource {
    id: u64,
    format: ImageFormat,
    bytes: Arc<[u8]>,
}

impl DisplayResource {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("img")
    }

    pub fn bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }
}

/// Token a surface fires once a resource is actually on screen.
#[derive(Debug)]
pub struct RenderAck {
    events: UnboundedSender<LinkEvent>,
    epoch: u64,
    stream: StreamKind,
    resource_id: u64,
}

impl RenderAck {
    pub fn resource_id(&self) -> u64 {
        self.resource_id
    }

    pub fn confirm(self) {
        let _ = self.events.send(LinkEvent::RenderConfirmed {
            epoch: self.epoch,
            stream: self.stream,
            resource_id: self.resource_id,
        });
    }
}

/// The visible surface for one image stream (collaborator)
pub trait DisplaySurface {
    /// Make `resource` the visible one and fire `ack` once it has been presented.
    fn present(&mut self, resource: &DisplayResource, ack: RenderAck);

    /// Pull mode: the surface fetches frames itself from `url`.
    fn attach_stream(&mut self, url: &Url);

    /// Detach to the empty placeholder state.
    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    Idle,
    AwaitingRender { resource_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Accepted { resource_id: u64 },
    DroppedBusy,
    DroppedMalformed,
}

/// Counts of resources handed out and given back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLedger {
    pub created: u64,
    pub released: u64,
}

pub struct ImageStreamChannel {
    stream: StreamKind,
    epoch: u64,
    events: UnboundedSender<LinkEvent>,
    state: Backpressure,
    current: Option<DisplayResource>,
    retiring: Option<DisplayResource>,
    next_id: u64,
    ledger: ResourceLedger,
    dropped: u64,
}

impl ImageStreamChannel {
    pub fn new(stream: StreamKind, epoch: u64, events: UnboundedSender<LinkEvent>) -> Self {
        ImageStreamChannel {
            stream,
            epoch,
            events,
            state: Backpressure::Idle,
            current: None,
            retiring: None,
            next_id: 1,
            ledger: ResourceLedger::default(),
            dropped: 0,
        }
    }

    pub fn on_frame(&mut self, buffer: &[u8], surface: &mut dyn DisplaySurface) -> FrameOutcome {
        if matches!(self.state, Backpressure::AwaitingRender { .. }) {
            self.dropped += 1;
            log::trace!("[{}] render pending, frame dropped", self.stream.name());
            return FrameOutcome::DroppedBusy;
        }

        let format = match sniff(buffer) {
            Some(format) => format,
            None => {
                self.dropped += 1;
                log::debug!(
                    "[{}] unrecognised frame ({} bytes) dropped",
                    self.stream.name(),
                    buffer.len()
                );
                return FrameOutcome::DroppedMalformed;
            }
        };

        let resource = DisplayResource {
            id: self.next_id,
            format,
            bytes: Arc::from(buffer),
        };
        self.next_id += 1;
        self.ledger.created += 1;

        let resource_id = resource.id;
        let ack = RenderAck {
            events: self.events.clone(),
            epoch: self.epoch,
            stream: self.stream,
            resource_id,
        };
        self.state = Backpressure::AwaitingRender { resource_id };
        surface.present(&resource, ack);

        // Only one render can be in flight, so the retiring slot is always empty here.
        if let Some(stale) = self.retiring.take() {
            self.release(stale);
        }
        self.retiring = self.current.replace(resource);

        FrameOutcome::Accepted { resource_id }
    }

    /// The surface has presented `resource_id`. Returns false for confirmations that do not
    /// match the render being awaited.
    pub fn render_confirmed(&mut self, resource_id: u64) -> bool {
        match self.state {
            Backpressure::AwaitingRender { resource_id: awaited } if awaited == resource_id => {
                self.state = Backpressure::Idle;
                if let Some(previous) = self.retiring.take() {
                    self.release(previous);
                }
                true
            }
            _ => {
                log::debug!(
                    "[{}] ignoring render confirmation for resource {}",
                    self.stream.name(),
                    resource_id
                );
                false
            }
        }
    }

    /// Return to idle, release everything held and blank the surface.
    pub fn reset(&mut self, surface: &mut dyn DisplaySurface) {
        self.state = Backpressure::Idle;
        if let Some(previous) = self.retiring.take() {
            self.release(previous);
        }
        if let Some(current) = self.current.take() {
            self.release(current);
        }
        surface.clear();
    }

    fn release(&mut self, resource: DisplayResource) {
        self.ledger.released += 1;
        log::trace!("[{}] released resource {}", self.stream.name(), resource.id);
        drop(resource);
    }

    pub fn state(&self) -> Backpressure {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state != Backpressure::Idle
    }

    pub fn current_id(&self) -> Option<u64> {
        self.current.as_ref().map(|r| r.id)
    }

    pub fn ledger(&self) -> ResourceLedger {
        self.ledger
    }

    /// Resources created and not yet released
    pub fn held(&self) -> u64 {
        self.ledger.created - self.ledger.released
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

fn sniff(buffer: &[u8]) -> Option<ImageFormat> {
    if buffer.is_empty() {
        return None;
    }
    image::guess_format(buffer).ok()
}
