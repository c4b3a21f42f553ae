use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub const DEFAULT_SPEED: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Back,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Forward,
        Direction::Back,
        Direction::Left,
        Direction::Right,
    ];

    /// `w`/`s`/`a`/`d`, case-insensitive
    pub fn from_key(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "w" => Some(Direction::Forward),
            "s" => Some(Direction::Back),
            "a" => Some(Direction::Left),
            "d" => Some(Direction::Right),
            _ => None,
        }
    }

    pub fn start(self) -> DriveCommand {
        DriveCommand::Move(self)
    }

    pub fn stop(self) -> DriveCommand {
        DriveCommand::Halt(self)
    }
}

/// Teleop command vocabulary understood by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveCommand {
    Move(Direction),
    Halt(Direction),
    Stop,
}

impl DriveCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveCommand::Move(Direction::Forward) => "MOVE_FORWARD",
            DriveCommand::Move(Direction::Back) => "MOVE_BACK",
            DriveCommand::Move(Direction::Left) => "MOVE_LEFT",
            DriveCommand::Move(Direction::Right) => "MOVE_RIGHT",
            DriveCommand::Halt(Direction::Forward) => "FORWARD_STOP",
            DriveCommand::Halt(Direction::Back) => "BACK_STOP",
            DriveCommand::Halt(Direction::Left) => "LEFT_STOP",
            DriveCommand::Halt(Direction::Right) => "RIGHT_STOP",
            DriveCommand::Stop => "STOP",
        }
    }
}

impl fmt::Display for DriveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared speed input (0-255), read at send time
#[derive(Debug, Clone)]
pub struct SpeedDial(Arc<AtomicU8>);

impl SpeedDial {
    pub fn new(initial: u8) -> Self {
        SpeedDial(Arc::new(AtomicU8::new(initial)))
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u8) {
        self.0.store(value, Ordering::Relaxed);
    }
}

impl Default for SpeedDial {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED)
    }
}

/// Outbound wire message
#[derive(Debug, Serialize)]
pub struct CommandMessage<'a> {
    pub client_id: &'a str,
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<u8>,
    /// Milliseconds since the unix epoch
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    NotConnected,
    Empty,
}

/// Bounded audit log, newest entry first
#[derive(Debug, Clone)]
pub struct CommandLog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl CommandLog {
    pub fn new(capacity: usize) -> Self {
        CommandLog {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push_front(line);
        self.lines.truncate(self.capacity);
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

/// Fire-and-forget wrapper over the session's command socket.
///
/// Does not track start/stop pairing; that is the input layer's job.
pub struct CommandChannel {
    client_id: String,
    outbound: Option<UnboundedSender<String>>,
    open: bool,
    speed: SpeedDial,
    log: CommandLog,
}

impl CommandChannel {
    pub fn new(client_id: &str, speed: SpeedDial, log_capacity: usize) -> Self {
        CommandChannel {
            client_id: client_id.to_string(),
            outbound: None,
            open: false,
            speed,
            log: CommandLog::new(log_capacity),
        }
    }

    /// Bind to a freshly opened socket's writer. Not ready until `mark_open`.
    pub fn attach(&mut self, outbound: UnboundedSender<String>) {
        self.outbound = Some(outbound);
        self.open = false;
    }

    pub fn mark_open(&mut self) {
        self.open = self.outbound.is_some();
    }

    pub fn mark_closed(&mut self) {
        self.open = false;
    }

    pub fn detach(&mut self) {
        self.outbound = None;
        self.open = false;
    }

    pub fn is_ready(&self) -> bool {
        self.open
            && self
                .outbound
                .as_ref()
                .map(|tx| !tx.is_closed())
                .unwrap_or(false)
    }

    /// Teleop command with the dial's current speed
    pub fn send(&mut self, command: DriveCommand) -> SendOutcome {
        let speed = self.speed.get();
        let outcome = self.transmit(command.as_str(), Some(speed));
        let mut line = format!("[CLIENT] {} speed={}", command, speed);
        if outcome != SendOutcome::Sent {
            line.push_str(" (not sent)");
        }
        self.log.push(line);
        outcome
    }

    /// Free-text command. Blank input is ignored and not logged.
    pub fn send_text(&mut self, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() {
            return SendOutcome::Empty;
        }
        let outcome = self.transmit(text, None);
        let mut line = format!("[CLIENT] {}", text);
        if outcome != SendOutcome::Sent {
            line.push_str(" (not sent)");
        }
        self.log.push(line);
        outcome
    }

    /// Inbound text from the agent, logged verbatim
    pub fn receive(&mut self, text: &str) {
        self.log.push(format!("[ROBOT] {}", text));
    }

    fn transmit(&mut self, command: &str, speed: Option<u8>) -> SendOutcome {
        if !self.is_ready() {
            log::debug!("[command] socket not ready, dropping {}", command);
            return SendOutcome::NotConnected;
        }
        let message = CommandMessage {
            client_id: &self.client_id,
            command,
            speed,
            ts: Utc::now().timestamp_millis(),
        };
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("[command] failed to encode {}: {}", command, e);
                return SendOutcome::NotConnected;
            }
        };
        match self.outbound.as_ref().map(|tx| tx.send(json)) {
            Some(Ok(())) => {
                log::debug!("[command] sent {}", command);
                SendOutcome::Sent
            }
            _ => {
                self.open = false;
                SendOutcome::NotConnected
            }
        }
    }

    pub fn log(&self) -> &CommandLog {
        &self.log
    }

    pub fn speed(&self) -> &SpeedDial {
        &self.speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_command_vocabulary() {
        let pairs: Vec<(&str, &str)> = Direction::ALL
            .iter()
            .map(|d| (d.start().as_str(), d.stop().as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("MOVE_FORWARD", "FORWARD_STOP"),
                ("MOVE_BACK", "BACK_STOP"),
                ("MOVE_LEFT", "LEFT_STOP"),
                ("MOVE_RIGHT", "RIGHT_STOP"),
            ]
        );
        assert_eq!(DriveCommand::Stop.to_string(), "STOP");
        assert_eq!(Direction::from_key("W"), Some(Direction::Forward));
        assert_eq!(Direction::from_key("q"), None);
    }

    #[test]
    fn test_send_while_closed_is_noop_but_logged() {
        let mut channel = CommandChannel::new("web-control", SpeedDial::new(80), 10);
        assert_eq!(
            channel.send(DriveCommand::Move(Direction::Left)),
            SendOutcome::NotConnected
        );
        assert_eq!(
            channel.log().render(),
            "[CLIENT] MOVE_LEFT speed=80 (not sent)"
        );

        // Attached but not yet opened
        let (tx, mut rx) = unbounded_channel();
        channel.attach(tx);
        assert_eq!(channel.send(DriveCommand::Stop), SendOutcome::NotConnected);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_encodes_payload() {
        let dial = SpeedDial::new(100);
        let mut channel = CommandChannel::new("web-control", dial.clone(), 10);
        let (tx, mut rx) = unbounded_channel();
        channel.attach(tx);
        channel.mark_open();

        dial.set(200);
        assert_eq!(channel.send(DriveCommand::Move(Direction::Forward)), SendOutcome::Sent);

        let json: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["client_id"], "web-control");
        assert_eq!(json["command"], "MOVE_FORWARD");
        assert_eq!(json["speed"], 200);
        assert!(json["ts"].as_i64().unwrap() > 0);
        assert_eq!(
            channel.log().lines().next(),
            Some("[CLIENT] MOVE_FORWARD speed=200")
        );
    }

    #[test]
    fn test_free_text_has_no_speed() {
        let mut channel = CommandChannel::new("web-control", SpeedDial::default(), 10);
        let (tx, mut rx) = unbounded_channel();
        channel.attach(tx);
        channel.mark_open();

        assert_eq!(channel.send_text("   "), SendOutcome::Empty);
        assert_eq!(channel.send_text("  LIGHTS_ON "), SendOutcome::Sent);

        let json: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["command"], "LIGHTS_ON");
        assert!(json.get("speed").is_none());
        assert_eq!(channel.log().len(), 1);
    }

    #[test]
    fn test_dropped_receiver_marks_not_ready() {
        let mut channel = CommandChannel::new("web-control", SpeedDial::default(), 10);
        let (tx, rx) = unbounded_channel();
        channel.attach(tx);
        channel.mark_open();
        drop(rx);

        assert!(!channel.is_ready());
        assert_eq!(channel.send(DriveCommand::Stop), SendOutcome::NotConnected);
    }

    #[test]
    fn test_log_is_bounded_newest_first() {
        let mut channel = CommandChannel::new("web-control", SpeedDial::default(), 3);
        for i in 0..5 {
            channel.receive(&format!("ack {i}"));
        }
        let lines: Vec<&str> = channel.log().lines().collect();
        assert_eq!(lines, vec!["[ROBOT] ack 4", "[ROBOT] ack 3", "[ROBOT] ack 2"]);
    }

    #[test]
    fn test_detach_closes() {
        let mut channel = CommandChannel::new("web-control", SpeedDial::default(), 3);
        let (tx, _rx) = unbounded_channel();
        channel.attach(tx);
        channel.mark_open();
        assert!(channel.is_ready());

        channel.detach();
        assert!(!channel.is_ready());
        channel.mark_open();
        assert!(!channel.is_ready());
    }
}
