use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use url::Url;

use crate::endpoints::StreamKind;
use crate::image_stream::{DisplayResource, DisplaySurface, RenderAck};
use crate::mjpeg::{self, PublishGate};

/// Shows a stream by keeping `<dir>/<stream>_latest.<ext>` current.
///
/// Presentation finishes when the file write does, which is when the render is confirmed.
/// Writes still in flight when the surface is cleared never reach the visible file.
pub struct FileSurface {
    stream: StreamKind,
    dir: PathBuf,
    client: reqwest::Client,
    gate: PublishGate,
    shown: Option<PathBuf>,
    /// Dropping this ends the pull task
    stop_puller: Option<oneshot::Sender<()>>,
}

impl FileSurface {
    pub fn new(stream: StreamKind, dir: &Path, client: reqwest::Client) -> Self {
        FileSurface {
            stream,
            dir: dir.to_path_buf(),
            client,
            gate: PublishGate::new(),
            shown: None,
            stop_puller: None,
        }
    }

    pub fn latest_path(&self, extension: &str) -> PathBuf {
        self.dir
            .join(format!("{}_latest.{}", self.stream.name(), extension))
    }

    pub fn shown(&self) -> Option<&Path> {
        self.shown.as_deref()
    }

    fn stop_puller(&mut self) {
        if let Some(stop) = self.stop_puller.take() {
            let _ = stop.send(());
        }
    }
}

impl DisplaySurface for FileSurface {
    fn present(&mut self, resource: &DisplayResource, ack: RenderAck) {
        let target = self.latest_path(resource.extension());
        let bytes = resource.bytes();
        let stream = self.stream.name();

        if let Some(stale) = self.shown.replace(target.clone()) {
            if stale != target {
                mjpeg::remove_if_present(&stale);
            }
        }

        let gate = self.gate.clone();
        let generation = gate.generation();
        tokio::spawn(async move {
            match gate.publish(generation, &target, &bytes).await {
                Ok(true) => {}
                Ok(false) => log::trace!("[{}] frame superseded by clear", stream),
                Err(e) => log::warn!("[{}] frame write failed: {:#}", stream, e),
            }
            // Confirm even on failure so the stream keeps flowing
            ack.confirm();
        });
    }

    fn attach_stream(&mut self, url: &Url) {
        self.stop_puller();
        let target = self.latest_path("jpg");
        self.shown = Some(target.clone());

        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_puller = Some(stop_tx);
        let gate = self.gate.clone();
        let generation = gate.generation();
        let client = self.client.clone();
        let url = url.clone();
        let stream = self.stream.name();
        tokio::spawn(async move {
            match mjpeg::pull_to_file(&client, &url, &target, &gate, generation, stop_rx).await {
                Ok(frames) => log::info!("[{}] mjpeg stream ended after {} frames", stream, frames),
                Err(e) => log::warn!("[{}] mjpeg stream failed: {:#}", stream, e),
            }
        });
    }

    fn clear(&mut self) {
        self.stop_puller();
        let shown: Vec<PathBuf> = self.shown.take().into_iter().collect();
        self.gate.invalidate(&shown);
        log::debug!("[{}] cleared", self.stream.name());
    }
}
