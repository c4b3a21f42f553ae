//! End-to-end controller scenarios with in-memory transport, presenter and surfaces.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyEventState, KeyModifiers};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::{advance, Duration};
use url::Url;

use rover_link::command::{Direction, SpeedDial};
use rover_link::config::LinkSettings;
use rover_link::endpoints::{ChannelKind, StreamKind};
use rover_link::image_stream::{DisplayResource, DisplaySurface, RenderAck};
use rover_link::live_status::{Element, Presenter};
use rover_link::teleop::{ButtonAction, Focus};
use rover_link::terminal::KeyMapper;
use rover_link::transport::{SocketHandle, Transport};
use rover_link::{InputEvent, LinkEvent, SessionController, SocketEvent, Surfaces};

const JPEG: [u8; 6] = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

type Writers = Arc<Mutex<HashMap<ChannelKind, UnboundedReceiver<String>>>>;

#[derive(Default)]
struct FakeTransport {
    writers: Writers,
}

impl Transport for FakeTransport {
    fn open(&mut self, channel: ChannelKind, _url: Url, _epoch: u64) -> SocketHandle {
        let (tx, rx) = unbounded_channel();
        self.writers.lock().unwrap().insert(channel, rx);
        SocketHandle::new(tx)
    }

    fn start_ticker(&mut self, _epoch: u64, _every: Duration) -> Option<JoinHandle<()>> {
        // Ticks are injected by the tests
        None
    }
}

#[derive(Default)]
struct FakePresenter {
    texts: HashMap<Element, String>,
}

impl Presenter for FakePresenter {
    fn set_text(&mut self, element: Element, value: &str) {
        self.texts.insert(element, value.to_string());
    }
}

#[derive(Default, Clone)]
struct FakeSurface {
    auto_confirm: bool,
    held_acks: Arc<Mutex<Vec<RenderAck>>>,
    presented: Arc<Mutex<Vec<u64>>>,
    cleared: Arc<Mutex<usize>>,
}

impl DisplaySurface for FakeSurface {
    fn present(&mut self, resource: &DisplayResource, ack: RenderAck) {
        self.presented.lock().unwrap().push(resource.id());
        if self.auto_confirm {
            ack.confirm();
        } else {
            self.held_acks.lock().unwrap().push(ack);
        }
    }

    fn attach_stream(&mut self, _url: &Url) {}

    fn clear(&mut self) {
        *self.cleared.lock().unwrap() += 1;
    }
}

struct Harness {
    controller: SessionController<FakeTransport, FakePresenter, FakeSurface>,
    events: UnboundedReceiver<LinkEvent>,
    writers: Writers,
    video: FakeSurface,
}

impl Harness {
    fn new(auto_confirm: bool) -> Self {
        Self::with_settings(
            auto_confirm,
            LinkSettings::new(Some("http://rover.local:8000".to_string())),
        )
    }

    fn with_settings(auto_confirm: bool, settings: LinkSettings) -> Self {
        let (tx, events) = unbounded_channel();
        let transport = FakeTransport::default();
        let writers = transport.writers.clone();
        let video = FakeSurface {
            auto_confirm,
            ..FakeSurface::default()
        };
        let thermal = FakeSurface {
            auto_confirm: true,
            ..FakeSurface::default()
        };
        let controller = SessionController::new(
            settings,
            transport,
            FakePresenter::default(),
            Surfaces {
                video: video.clone(),
                thermal,
            },
            tx,
            SpeedDial::new(120),
            std::env::temp_dir(),
        );
        Harness {
            controller,
            events,
            writers,
            video,
        }
    }

    fn epoch(&self) -> u64 {
        self.controller.epoch()
    }

    fn socket(&mut self, channel: ChannelKind, event: SocketEvent) {
        let epoch = self.epoch();
        self.controller.handle(LinkEvent::Socket {
            epoch,
            channel,
            event,
        });
    }

    fn frame(&mut self) {
        self.socket(ChannelKind::Video, SocketEvent::Binary(JPEG.to_vec()));
        self.pump();
    }

    fn telemetry(&mut self, json: &str) {
        self.socket(ChannelKind::Telemetry, SocketEvent::Text(json.to_string()));
    }

    fn tick(&mut self) {
        let epoch = self.epoch();
        self.controller.handle(LinkEvent::LivenessTick { epoch });
    }

    fn input(&mut self, input: InputEvent) {
        self.controller.handle(LinkEvent::Input(input));
    }

    /// Deliver queued render confirmations
    fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.controller.handle(event);
        }
    }

    fn status(&self) -> &str {
        &self.controller.presenter().texts[&Element::Status]
    }

    fn text(&self, element: Element) -> &str {
        &self.controller.presenter().texts[&element]
    }

    fn sent_commands(&self) -> Vec<String> {
        let mut writers = self.writers.lock().unwrap();
        let Some(rx) = writers.get_mut(&ChannelKind::Command) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            let value: Value = serde_json::from_str(&json).unwrap();
            out.push(value["command"].as_str().unwrap().to_string());
        }
        out
    }
}

#[tokio::test(start_paused = true)]
async fn single_frame_then_silence_goes_offline_and_blanks() {
    let mut h = Harness::new(true);
    h.controller.connect();
    h.socket(ChannelKind::Video, SocketEvent::Opened);
    assert_eq!(h.status(), "waiting for robot: detectionbot");

    h.frame();
    assert_eq!(h.video.presented.lock().unwrap().len(), 1);

    advance(Duration::from_millis(9_000)).await;
    h.tick();
    assert_eq!(h.status(), "waiting for robot: detectionbot");

    advance(Duration::from_millis(1_500)).await;
    h.tick();
    assert_eq!(h.status(), "robot offline");
    assert_eq!(*h.video.cleared.lock().unwrap(), 1);

    let session = h.controller.session().unwrap();
    let video = session.image_channel(StreamKind::Video).unwrap();
    assert!(!video.is_busy());
    assert_eq!(video.held(), 0);
}

#[tokio::test(start_paused = true)]
async fn thermal_frame_before_video_open_still_goes_stale() {
    let mut h = Harness::new(true);
    h.controller.connect();

    h.socket(ChannelKind::Thermal, SocketEvent::Binary(JPEG.to_vec()));
    h.pump();
    h.socket(ChannelKind::Video, SocketEvent::Opened);
    assert_eq!(h.controller.session().unwrap().liveness().frame_count(), 1);

    advance(Duration::from_secs(11)).await;
    h.tick();
    assert_eq!(h.status(), "robot offline");
    let thermal = h
        .controller
        .session()
        .unwrap()
        .image_channel(StreamKind::Thermal)
        .unwrap();
    assert_eq!(thermal.held(), 0);
}

#[tokio::test(start_paused = true)]
async fn pull_mode_surface_is_blanked_when_offline() {
    let mut settings = LinkSettings::new(Some("http://rover.local:8000".to_string()));
    settings.video_pull = true;
    let mut h = Harness::with_settings(true, settings);
    h.controller.connect();

    let session = h.controller.session().unwrap();
    assert!(session.image_channel(StreamKind::Video).is_none());
    assert!(session.liveness().is_checking());
    assert_eq!(*h.video.cleared.lock().unwrap(), 0);

    h.telemetry(r#"{"methane_ppm": 12}"#);
    advance(Duration::from_secs(5)).await;
    h.tick();
    assert_eq!(h.status(), "connected: detectionbot");

    advance(Duration::from_secs(6)).await;
    h.tick();
    assert_eq!(h.status(), "robot offline");
    assert_eq!(*h.video.cleared.lock().unwrap(), 1);
    assert!(h.video.presented.lock().unwrap().is_empty());
    assert!(h
        .controller
        .session()
        .unwrap()
        .image_channel(StreamKind::Video)
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn streaming_is_live_until_silence_exceeds_threshold() {
    let mut h = Harness::new(true);
    h.controller.connect();
    h.socket(ChannelKind::Video, SocketEvent::Opened);

    h.frame();
    h.frame();
    assert_eq!(h.status(), "connected: detectionbot");
    assert_eq!(h.controller.session().unwrap().liveness().frame_count(), 2);

    advance(Duration::from_secs(10)).await;
    h.tick();
    // Exactly at the threshold is still alive
    assert_eq!(h.status(), "connected: detectionbot");

    advance(Duration::from_millis(1)).await;
    h.tick();
    assert_eq!(h.status(), "robot offline");
}

#[tokio::test(start_paused = true)]
async fn telemetry_alone_keeps_the_link_alive() {
    let mut h = Harness::new(true);
    h.controller.connect();
    h.socket(ChannelKind::Video, SocketEvent::Opened);

    for _ in 0..6 {
        h.telemetry(r#"{"methane_ppm": 410}"#);
        advance(Duration::from_secs(4)).await;
        h.tick();
        assert_eq!(h.status(), "connected: detectionbot");
    }
    assert_eq!(h.text(Element::Methane), "410");
}

#[tokio::test(start_paused = true)]
async fn video_close_stops_liveness_checks() {
    let mut h = Harness::new(true);
    h.controller.connect();
    h.socket(ChannelKind::Video, SocketEvent::Opened);
    h.frame();
    h.socket(ChannelKind::Video, SocketEvent::Closed);
    assert_eq!(h.status(), "disconnected");

    advance(Duration::from_secs(30)).await;
    h.tick();
    assert_eq!(h.status(), "disconnected");
    assert!(!h.controller.session().unwrap().liveness().is_checking());
}

#[tokio::test]
async fn frames_are_dropped_while_a_render_is_pending() {
    let mut h = Harness::new(false);
    h.controller.connect();

    h.frame();
    h.frame();
    h.frame();
    assert_eq!(*h.video.presented.lock().unwrap(), vec![1]);

    let ack = h.video.held_acks.lock().unwrap().pop().unwrap();
    ack.confirm();
    h.pump();

    h.frame();
    assert_eq!(*h.video.presented.lock().unwrap(), vec![1, 2]);

    let video = h
        .controller
        .session()
        .unwrap()
        .image_channel(StreamKind::Video)
        .unwrap();
    assert_eq!(video.dropped(), 2);
    assert!(video.is_busy());
    // Resource 1 stays held until 2 is confirmed
    assert_eq!(video.held(), 2);
}

#[tokio::test]
async fn render_confirmation_from_old_session_is_ignored() {
    let mut h = Harness::new(false);
    h.controller.connect();
    h.frame();
    let stale = h.video.held_acks.lock().unwrap().pop().unwrap();

    h.controller.connect();
    h.frame();
    stale.confirm();
    h.pump();

    let video = h
        .controller
        .session()
        .unwrap()
        .image_channel(StreamKind::Video)
        .unwrap();
    assert!(video.is_busy());
    assert_eq!(h.epoch(), 2);
}

#[tokio::test]
async fn zero_readings_do_not_overwrite_good_values() {
    let mut h = Harness::new(true);
    h.controller.connect();

    h.telemetry(r#"{"esp32_tempC": 21.5, "temperature_c": 99, "humidity": 40}"#);
    h.telemetry(r#"{"esp32_tempC": 0, "humidity": "0"}"#);
    h.telemetry("not json");
    h.telemetry("[1, 2]");

    assert_eq!(h.text(Element::Temperature), "21.50");
    assert_eq!(h.text(Element::Humidity), "40.00");
    assert_eq!(h.text(Element::Alcohol), "--");
    assert_eq!(h.controller.session().unwrap().smoother().samples(), 2);
}

#[tokio::test]
async fn recorder_skips_repeated_timestamps() {
    let mut h = Harness::new(true);
    h.controller.connect();

    h.telemetry(r#"{"ts": 99, "methane_ppm": 1}"#);
    h.input(InputEvent::ToggleRecording);
    h.telemetry(r#"{"ts": 100, "methane_ppm": 2}"#);
    h.telemetry(r#"{"ts": 100, "methane_ppm": 3}"#);
    h.telemetry(r#"{"ts": 101, "methane_ppm": 4}"#);

    let rows = h.controller.recorder().rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].methane_ppm, Some(2.0));
    assert_eq!(rows[1].ts, 101.0);
    assert_eq!(rows[1].uuid, "detectionbot");
    assert_eq!(h.text(Element::RecordingStatus), "Recording (2 rows)");

    h.input(InputEvent::ToggleRecording);
    h.telemetry(r#"{"ts": 102}"#);
    assert_eq!(h.controller.recorder().len(), 2);
    assert_eq!(h.text(Element::RecordingStatus), "Not recording");
}

#[tokio::test]
async fn held_key_sends_one_start_and_one_stop() {
    let mut h = Harness::new(true);
    h.controller.connect();
    h.socket(ChannelKind::Command, SocketEvent::Opened);
    assert_eq!(h.status(), "command connected: detectionbot");

    let w = || InputEvent::KeyDown {
        key: "w".into(),
        focus: Focus::Page,
    };
    h.input(w());
    h.input(w());
    h.input(w());
    h.input(InputEvent::KeyUp {
        key: "w".into(),
        focus: Focus::Page,
    });
    assert_eq!(h.sent_commands(), vec!["MOVE_FORWARD", "FORWARD_STOP"]);

    let log = h.text(Element::CommandLog).to_string();
    assert_eq!(
        log.lines().next(),
        Some("[CLIENT] FORWARD_STOP speed=120")
    );
}

#[tokio::test]
async fn hold_buttons_and_text_focus() {
    let mut h = Harness::new(true);
    h.controller.connect();
    h.socket(ChannelKind::Command, SocketEvent::Opened);

    let button = |action| InputEvent::Button {
        direction: Direction::Left,
        action,
    };
    h.input(button(ButtonAction::TouchStart));
    h.input(button(ButtonAction::MouseDown));
    h.input(button(ButtonAction::MouseLeave));
    h.input(InputEvent::KeyDown {
        key: "d".into(),
        focus: Focus::TextEntry,
    });
    h.input(InputEvent::StopButton);
    h.input(InputEvent::SubmitText("  LIGHTS_ON ".into()));
    h.input(InputEvent::SubmitText("   ".into()));

    assert_eq!(
        h.sent_commands(),
        vec!["MOVE_LEFT", "LEFT_STOP", "STOP", "LIGHTS_ON"]
    );
}

#[tokio::test]
async fn entering_text_mode_stops_a_held_key() {
    let mut h = Harness::new(true);
    h.controller.connect();
    h.socket(ChannelKind::Command, SocketEvent::Opened);

    let key = |code, kind| KeyEvent {
        code,
        modifiers: KeyModifiers::NONE,
        kind,
        state: KeyEventState::NONE,
    };
    let mut mapper = KeyMapper::new(SpeedDial::new(120), true);
    for event in [
        key(KeyCode::Char('w'), KeyEventKind::Press),
        key(KeyCode::Char(':'), KeyEventKind::Press),
        key(KeyCode::Char('w'), KeyEventKind::Release),
    ] {
        for input in mapper.translate(event) {
            h.input(input);
        }
    }
    assert_eq!(h.sent_commands(), vec!["MOVE_FORWARD", "FORWARD_STOP"]);
    assert_eq!(mapper.focus(), Focus::TextEntry);
}

#[tokio::test]
async fn commands_before_open_are_logged_not_sent() {
    let mut h = Harness::new(true);
    h.controller.connect();

    h.input(InputEvent::StopButton);
    assert!(h.sent_commands().is_empty());
    assert_eq!(
        h.text(Element::CommandLog),
        "[CLIENT] STOP speed=120 (not sent)"
    );

    h.socket(ChannelKind::Command, SocketEvent::Text("ACK STOP".into()));
    assert!(h
        .text(Element::CommandLog)
        .starts_with("[ROBOT] ACK STOP"));
}

#[tokio::test]
async fn reconnect_clears_held_keys() {
    let mut h = Harness::new(true);
    h.controller.connect();
    h.socket(ChannelKind::Command, SocketEvent::Opened);
    h.input(InputEvent::KeyDown {
        key: "s".into(),
        focus: Focus::Page,
    });
    assert_eq!(h.sent_commands(), vec!["MOVE_BACK"]);

    h.input(InputEvent::Connect);
    h.socket(ChannelKind::Command, SocketEvent::Opened);
    h.input(InputEvent::KeyDown {
        key: "s".into(),
        focus: Focus::Page,
    });
    assert_eq!(h.sent_commands(), vec!["MOVE_BACK"]);
}

#[tokio::test]
async fn missing_server_reports_status() {
    let (tx, _rx) = unbounded_channel();
    let mut controller = SessionController::new(
        LinkSettings::new(Some("   ".into())),
        FakeTransport::default(),
        FakePresenter::default(),
        Surfaces {
            video: FakeSurface::default(),
            thermal: FakeSurface::default(),
        },
        tx,
        SpeedDial::default(),
        std::env::temp_dir(),
    );
    controller.connect();
    assert_eq!(
        controller.presenter().texts[&Element::Status],
        "server url required"
    );
    assert!(controller.session().is_none());
}
