//! Pull-mode image source: an HTTP `multipart/x-mixed-replace` JPEG stream.

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use url::Url;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on buffered bytes while waiting for an end-of-image marker
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Splits a byte stream into complete JPEG images by their start/end markers.
///
/// Multipart boundaries and part headers fall outside SOI..EOI and are skipped.
#[derive(Debug)]
pub struct FrameExtractor {
    buffer: Vec<u8>,
    max_bytes: usize,
    overflowed: u64,
}

impl FrameExtractor {
    pub fn new(max_bytes: usize) -> Self {
        FrameExtractor {
            buffer: Vec::new(),
            max_bytes,
            overflowed: 0,
        }
    }

    /// Feed one chunk, returning every image it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buffer, &SOI, 0) else {
                // Keep a trailing 0xFF that may begin the next marker
                let keep = usize::from(self.buffer.last() == Some(&0xFF));
                let cut = self.buffer.len() - keep;
                self.buffer.drain(..cut);
                break;
            };
            if start > 0 {
                self.buffer.drain(..start);
            }
            match find(&self.buffer, &EOI, SOI.len()) {
                Some(end) => {
                    let frame: Vec<u8> = self.buffer.drain(..end + EOI.len()).collect();
                    frames.push(frame);
                }
                None => break,
            }
        }

        if self.buffer.len() > self.max_bytes {
            log::warn!(
                "[mjpeg] no end marker within {} bytes, discarding",
                self.buffer.len()
            );
            self.buffer.clear();
            self.overflowed += 1;
        }
        frames
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Pull `url` until the stream ends or `stop` fires, publishing each complete frame to
/// `target` under `generation`. Returns the number of frames written.
pub async fn pull_to_file(
    client: &reqwest::Client,
    url: &Url,
    target: &Path,
    gate: &PublishGate,
    generation: u64,
    mut stop: oneshot::Receiver<()>,
) -> Result<u64> {
    let response = tokio::select! {
        response = client.get(url.as_str()).send() => {
            response.with_context(|| format!("requesting {}", url))?
        }
        _ = &mut stop => return Ok(0),
    };
    if !response.status().is_success() {
        bail!("{} returned {}", url, response.status());
    }

    let mut extractor = FrameExtractor::new(MAX_FRAME_BYTES);
    let mut body = response.bytes_stream();
    let mut written = 0u64;

    loop {
        // Only waiting is interrupted; a publish in progress always runs to completion
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = &mut stop => break,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk.context("reading mjpeg body")?;
        // Only the newest complete frame is worth writing
        if let Some(frame) = extractor.push(&chunk).pop() {
            if !gate.publish(generation, target, &frame).await? {
                break;
            }
            written += 1;
        }
    }
    Ok(written)
}

/// Orders frame files going live against the surface being blanked.
///
/// Frames are written to a temp file and renamed into place. Each `invalidate` bumps the
/// generation, and a rename still carrying an older generation is dropped.
#[derive(Debug, Clone, Default)]
pub struct PublishGate {
    generation: Arc<Mutex<u64>>,
}

impl PublishGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new generation and remove `targets` along with the current generation's temp files.
    pub fn invalidate(&self, targets: &[PathBuf]) {
        let mut generation = self.lock();
        for target in targets {
            remove_if_present(target);
            remove_if_present(&temp_path(target, *generation));
        }
        *generation += 1;
    }

    /// Write `bytes` to `target` unless `generation` has been invalidated meanwhile.
    /// Returns whether the frame went live.
    pub async fn publish(&self, generation: u64, target: &Path, bytes: &[u8]) -> Result<bool> {
        let tmp = temp_path(target, generation);
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;

        let gate = self.clone();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || gate.commit(generation, &tmp, &target))
            .await
            .context("publish task failed")?
    }

    fn commit(&self, generation: u64, tmp: &Path, target: &Path) -> Result<bool> {
        let current = self.lock();
        if *current != generation {
            remove_if_present(tmp);
            return Ok(false);
        }
        std::fs::rename(tmp, target)
            .with_context(|| format!("renaming to {}", target.display()))?;
        Ok(true)
    }
}

/// Remove `path`, tolerating a file that is already gone.
pub fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::trace!("[mjpeg] removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[mjpeg] could not remove {}: {}", path.display(), e),
    }
}

fn temp_path(target: &Path, generation: u64) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", generation));
    target.with_file_name(name)
}
