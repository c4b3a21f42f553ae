use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::endpoints::ChannelKind;
use crate::events::{LinkEvent, SocketEvent};
use crate::liveness::liveness_ticker;

/// Owning handle for one open (or opening) socket
#[derive(Debug)]
pub struct SocketHandle {
    outbound: Option<UnboundedSender<String>>,
}

impl SocketHandle {
    pub fn new(outbound: UnboundedSender<String>) -> Self {
        SocketHandle {
            outbound: Some(outbound),
        }
    }

    /// Writer for outbound text frames
    pub fn outbound(&self) -> Option<UnboundedSender<String>> {
        self.outbound.clone()
    }

    /// Dropping the writer tells the socket task to send a close frame and exit. Whatever the
    /// task emits afterwards carries a stale epoch.
    pub fn close(mut self) {
        self.outbound.take();
    }
}

/// Opens channels and timers for the session controller
pub trait Transport {
    fn open(&mut self, channel: ChannelKind, url: Url, epoch: u64) -> SocketHandle;

    fn start_ticker(&mut self, epoch: u64, every: Duration) -> Option<JoinHandle<()>>;
}

/// Websocket transport over tokio-tungstenite; every callback becomes a `LinkEvent`.
#[derive(Clone)]
pub struct TokioTransport {
    events: UnboundedSender<LinkEvent>,
}

impl TokioTransport {
    pub fn new(events: UnboundedSender<LinkEvent>) -> Self {
        TokioTransport { events }
    }
}

impl Transport for TokioTransport {
    fn open(&mut self, channel: ChannelKind, url: Url, epoch: u64) -> SocketHandle {
        let (outbound_tx, outbound_rx) = unbounded_channel();
        tokio::spawn(run_socket(
            channel,
            url,
            epoch,
            self.events.clone(),
            outbound_rx,
        ));
        SocketHandle::new(outbound_tx)
    }

    fn start_ticker(&mut self, epoch: u64, every: Duration) -> Option<JoinHandle<()>> {
        Some(tokio::spawn(liveness_ticker(self.events.clone(), epoch, every)))
    }
}

async fn run_socket(
    channel: ChannelKind,
    url: Url,
    epoch: u64,
    events: UnboundedSender<LinkEvent>,
    mut outbound: UnboundedReceiver<String>,
) {
    let emit = |event: SocketEvent| {
        events
            .send(LinkEvent::Socket {
                epoch,
                channel,
                event,
            })
            .is_ok()
    };

    log::debug!("[{}] connecting to {}", channel.name(), url);
    let connected = tokio::select! {
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
        _ = wait_closed(&mut outbound) => {
            log::debug!("[{}] closed before connecting", channel.name());
            return;
        }
    };

    let (stream, _response) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            emit(SocketEvent::Error(e.to_string()));
            emit(SocketEvent::Closed);
            return;
        }
    };
    if !emit(SocketEvent::Opened) {
        return;
    }

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            incoming = read.next() => {
                let delivered = match incoming {
                    Some(Ok(Message::Binary(data))) => emit(SocketEvent::Binary(data.into())),
                    Some(Ok(Message::Text(text))) => emit(SocketEvent::Text(text.to_string())),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => true,
                    Some(Err(e)) => {
                        emit(SocketEvent::Error(e.to_string()));
                        break;
                    }
                };
                if !delivered {
                    break;
                }
            }
            outgoing = outbound.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        emit(SocketEvent::Error(e.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
    emit(SocketEvent::Closed);
}

async fn wait_closed(outbound: &mut UnboundedReceiver<String>) {
    // Nothing can be sent before the socket reports open, so anything queued is stale
    while outbound.recv().await.is_some() {}
}
