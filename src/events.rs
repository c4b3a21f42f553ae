use crate::command::Direction;
use crate::endpoints::{ChannelKind, StreamKind};
use crate::teleop::{ButtonAction, Focus};

/// Everything the session loop reacts to. Transport, timer and render callbacks are tagged with
/// the epoch of the session that spawned them so late arrivals can be discarded.
#[derive(Debug)]
pub enum LinkEvent {
    Socket {
        epoch: u64,
        channel: ChannelKind,
        event: SocketEvent,
    },
    RenderConfirmed {
        epoch: u64,
        stream: StreamKind,
        resource_id: u64,
    },
    LivenessTick {
        epoch: u64,
    },
    Input(InputEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Opened,
    Binary(Vec<u8>),
    Text(String),
    Closed,
    Error(String),
}

/// User input, already stripped of presentation details
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    KeyDown { key: String, focus: Focus },
    KeyUp { key: String, focus: Focus },
    Button { direction: Direction, action: ButtonAction },
    StopButton,
    SubmitText(String),
    SetSpeed(u8),
    ToggleRecording,
    ClearRecording,
    ExportCsv,
    Connect,
    Disconnect,
    Quit,
}
