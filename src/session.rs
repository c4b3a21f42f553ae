//! Connection lifecycle across all channels.
//!
//! The controller is the only component allowed to build or tear down per-session state. All of
//! that state lives in one [`Session`] value, so a reconnect always starts from a clean slate.
//! Teardown runs in a fixed order: stop timers, close sockets, clear backpressure/liveness/teleop
//! state, blank displays.

use chrono::{Local, Utc};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::command::{CommandChannel, DriveCommand, SendOutcome, SpeedDial};
use crate::config::LinkSettings;
use crate::endpoints::{ChannelKind, Endpoints, StreamKind};
use crate::error::LinkError;
use crate::events::{InputEvent, LinkEvent, SocketEvent};
use crate::image_stream::{DisplaySurface, ImageStreamChannel};
use crate::live_status::{Element, Presenter};
use crate::liveness::{Arrival, LivenessMonitor};
use crate::recorder::SampleRecorder;
use crate::telemetry::{format_reading, last_update_label, TelemetrySample, TelemetrySmoother};
use crate::teleop::TeleopInput;
use crate::transport::{SocketHandle, Transport};

/// How frames reach one image surface
pub enum StreamSlot {
    Socket(ImageStreamChannel),
    /// The surface pulls frames itself; only blanking is ours
    Pull,
}

/// Everything that lives exactly as long as one connection attempt
pub struct Session {
    epoch: u64,
    endpoints: Endpoints,
    liveness: LivenessMonitor,
    video: StreamSlot,
    thermal: StreamSlot,
    smoother: TelemetrySmoother,
    teleop: TeleopInput,
    sockets: Vec<(ChannelKind, SocketHandle)>,
    ticker: Option<JoinHandle<()>>,
    first_render_seen: bool,
    offline_reported: bool,
}

impl Session {
    fn new(epoch: u64, endpoints: Endpoints, settings: &LinkSettings) -> Self {
        Session {
            epoch,
            endpoints,
            liveness: LivenessMonitor::new(settings.silence_threshold, settings.check_interval),
            video: StreamSlot::Pull,
            thermal: StreamSlot::Pull,
            smoother: TelemetrySmoother::new(),
            teleop: TeleopInput::new(),
            sockets: Vec::new(),
            ticker: None,
            first_render_seen: false,
            offline_reported: false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    pub fn smoother(&self) -> &TelemetrySmoother {
        &self.smoother
    }

    pub fn teleop(&self) -> &TeleopInput {
        &self.teleop
    }

    pub fn slot(&self, stream: StreamKind) -> &StreamSlot {
        match stream {
            StreamKind::Video => &self.video,
            StreamKind::Thermal => &self.thermal,
        }
    }

    fn slot_mut(&mut self, stream: StreamKind) -> &mut StreamSlot {
        match stream {
            StreamKind::Video => &mut self.video,
            StreamKind::Thermal => &mut self.thermal,
        }
    }

    pub fn image_channel(&self, stream: StreamKind) -> Option<&ImageStreamChannel> {
        match self.slot(stream) {
            StreamSlot::Socket(channel) => Some(channel),
            StreamSlot::Pull => None,
        }
    }

    pub fn open_channels(&self) -> Vec<ChannelKind> {
        self.sockets.iter().map(|(kind, _)| *kind).collect()
    }

    fn arm_ticker<T: Transport>(&mut self, transport: &mut T) {
        self.stop_ticker();
        self.liveness.arm();
        self.ticker = transport.start_ticker(self.epoch, self.liveness.check_interval());
    }

    fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

/// The two image surfaces, which outlive sessions
pub struct Surfaces<S> {
    pub video: S,
    pub thermal: S,
}

impl<S> Surfaces<S> {
    pub fn get(&self, stream: StreamKind) -> &S {
        match stream {
            StreamKind::Video => &self.video,
            StreamKind::Thermal => &self.thermal,
        }
    }

    fn get_mut(&mut self, stream: StreamKind) -> &mut S {
        match stream {
            StreamKind::Video => &mut self.video,
            StreamKind::Thermal => &mut self.thermal,
        }
    }
}

pub struct SessionController<T, P, S> {
    settings: LinkSettings,
    transport: T,
    presenter: P,
    surfaces: Surfaces<S>,
    events: UnboundedSender<LinkEvent>,
    epoch: u64,
    session: Option<Session>,
    recorder: SampleRecorder,
    commands: CommandChannel,
    export_dir: PathBuf,
}

impl<T, P, S> SessionController<T, P, S>
where
    T: Transport,
    P: Presenter,
    S: DisplaySurface,
{
    pub fn new(
        settings: LinkSettings,
        transport: T,
        presenter: P,
        surfaces: Surfaces<S>,
        events: UnboundedSender<LinkEvent>,
        speed: SpeedDial,
        export_dir: PathBuf,
    ) -> Self {
        let commands = CommandChannel::new(
            &settings.client_id,
            speed,
            settings.command_log_capacity,
        );
        let mut controller = SessionController {
            settings,
            transport,
            presenter,
            surfaces,
            events,
            epoch: 0,
            session: None,
            recorder: SampleRecorder::new(),
            commands,
            export_dir,
        };
        controller.refresh_recording();
        let speed = controller.commands.speed().get().to_string();
        controller.presenter.set_text(Element::Speed, &speed);
        controller
    }

    /// Tear down any current session and open a fresh one.
    pub fn connect(&mut self) {
        self.disconnect();

        let robot = self.settings.robot_id.clone();
        self.set_status(&format!("connecting to {}", robot));
        log::info!("[session] connect requested: {}", robot);

        let base = self.settings.server_url.clone().unwrap_or_default();
        let endpoints = match Endpoints::from_base(&base, &robot) {
            Ok(endpoints) => endpoints,
            Err(LinkError::MissingServer) => {
                self.set_status("server url required");
                return;
            }
            Err(e) => {
                log::warn!("[session] {}", e);
                self.set_status(&e.to_string());
                return;
            }
        };

        self.epoch += 1;
        let mut session = Session::new(self.epoch, endpoints, &self.settings);

        for stream in [StreamKind::Video, StreamKind::Thermal] {
            let pull = match stream {
                StreamKind::Video => self.settings.video_pull,
                StreamKind::Thermal => self.settings.thermal_pull,
            };
            if pull {
                self.attach_pull(&mut session, stream);
            } else {
                *session.slot_mut(stream) = StreamSlot::Socket(ImageStreamChannel::new(
                    stream,
                    session.epoch,
                    self.events.clone(),
                ));
                self.open_socket(&mut session, stream.channel());
            }
        }

        self.open_socket(&mut session, ChannelKind::Telemetry);
        if let Some(outbound) = self.open_socket(&mut session, ChannelKind::Command) {
            self.commands.attach(outbound);
        }

        self.session = Some(session);
    }

    /// Total teardown; safe to call without a session.
    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop_ticker();

            self.commands.detach();
            for (kind, socket) in session.sockets.drain(..) {
                log::debug!("[{}] closing socket", kind.name());
                socket.close();
            }

            session.liveness.halt();
            session.teleop.clear();
            for stream in [StreamKind::Video, StreamKind::Thermal] {
                let surface = self.surfaces.get_mut(stream);
                match session.slot_mut(stream) {
                    StreamSlot::Socket(channel) => channel.reset(surface),
                    StreamSlot::Pull => surface.clear(),
                }
            }
        }
        self.set_status("disconnected");
        log::info!("[session] disconnected");
    }

    pub fn handle(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Socket {
                epoch,
                channel,
                event,
            } => {
                if self.is_current(epoch) {
                    self.on_socket(channel, event);
                } else {
                    log::trace!("[{}] stale event from epoch {}", channel.name(), epoch);
                }
            }
            LinkEvent::RenderConfirmed {
                epoch,
                stream,
                resource_id,
            } => {
                if self.is_current(epoch) {
                    self.on_render_confirmed(stream, resource_id);
                }
            }
            LinkEvent::LivenessTick { epoch } => {
                if self.is_current(epoch) {
                    self.on_liveness_tick();
                }
            }
            LinkEvent::Input(input) => self.on_input(input),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.session
            .as_ref()
            .map(|s| s.epoch == epoch)
            .unwrap_or(false)
    }

    fn attach_pull(&mut self, session: &mut Session, stream: StreamKind) {
        *session.slot_mut(stream) = StreamSlot::Pull;
        match session
            .endpoints
            .mjpeg_url(stream, Utc::now().timestamp_millis())
        {
            Ok(url) => {
                self.surfaces.get_mut(stream).attach_stream(&url);
                log::info!("[{}] mjpeg stream attached", stream.name());
            }
            Err(e) => log::warn!("[{}] no mjpeg url: {}", stream.name(), e),
        }
        // Pull-mode video has no open event, so liveness starts right away
        if stream == StreamKind::Video {
            self.set_status(&format!(
                "waiting for robot: {} (mjpeg)",
                self.settings.robot_id
            ));
            session.arm_ticker(&mut self.transport);
        }
    }

    fn open_socket(
        &mut self,
        session: &mut Session,
        channel: ChannelKind,
    ) -> Option<UnboundedSender<String>> {
        let url = match session.endpoints.socket_url(channel) {
            Ok(url) => url,
            Err(e) => {
                log::warn!("[{}] no socket url: {}", channel.name(), e);
                return None;
            }
        };
        let handle = self.transport.open(channel, url, session.epoch);
        let outbound = handle.outbound();
        session.sockets.push((channel, handle));
        outbound
    }

    fn on_socket(&mut self, channel: ChannelKind, event: SocketEvent) {
        let robot = self.settings.robot_id.clone();
        match (channel, event) {
            (_, SocketEvent::Error(e)) => {
                log::warn!("[{}] socket error: {}", channel.name(), e);
            }

            (ChannelKind::Video, SocketEvent::Opened) => {
                self.set_status(&format!("waiting for robot: {}", robot));
                if let Some(session) = self.session.as_mut() {
                    session.arm_ticker(&mut self.transport);
                }
                log::info!("[video] socket connected");
            }
            (ChannelKind::Video, SocketEvent::Closed) => {
                if let Some(session) = self.session.as_mut() {
                    session.stop_ticker();
                    session.liveness.halt();
                }
                self.set_status("disconnected");
                log::info!("[video] socket disconnected");
            }
            (ChannelKind::Video, SocketEvent::Binary(data)) => {
                self.on_frame(StreamKind::Video, &data);
            }
            (ChannelKind::Thermal, SocketEvent::Binary(data)) => {
                self.on_frame(StreamKind::Thermal, &data);
            }
            (ChannelKind::Thermal, SocketEvent::Opened) => {
                log::info!("[thermal] socket connected");
            }
            (ChannelKind::Thermal, SocketEvent::Closed) => {
                log::info!("[thermal] socket disconnected");
            }
            (ChannelKind::Video | ChannelKind::Thermal, SocketEvent::Text(_)) => {
                log::debug!("[{}] ignoring text message", channel.name());
            }

            (ChannelKind::Telemetry, SocketEvent::Opened) => {
                self.set_status(&format!("telemetry connected: {}", robot));
                log::info!("[telemetry] socket connected");
            }
            (ChannelKind::Telemetry, SocketEvent::Closed) => {
                self.set_status("telemetry disconnected");
                log::info!("[telemetry] socket disconnected");
            }
            (ChannelKind::Telemetry, SocketEvent::Text(text)) => self.on_telemetry(&text),
            (ChannelKind::Telemetry, SocketEvent::Binary(data)) => {
                self.on_telemetry(&String::from_utf8_lossy(&data));
            }

            (ChannelKind::Command, SocketEvent::Opened) => {
                self.commands.mark_open();
                self.set_status(&format!("command connected: {}", robot));
                log::info!("[command] socket connected");
            }
            (ChannelKind::Command, SocketEvent::Closed) => {
                self.commands.mark_closed();
                self.set_status("command disconnected");
                log::info!("[command] socket disconnected");
            }
            (ChannelKind::Command, SocketEvent::Text(text)) => {
                self.commands.receive(&text);
                self.refresh_command_log();
                log::info!("[command] received from robot");
            }
            (ChannelKind::Command, SocketEvent::Binary(data)) => {
                self.commands.receive(&String::from_utf8_lossy(&data));
                self.refresh_command_log();
            }
        }
    }

    fn on_frame(&mut self, stream: StreamKind, data: &[u8]) {
        let now = Instant::now();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        session.offline_reported = false;
        match session.liveness.on_frame(now) {
            Arrival::First => log::info!("[liveness] first frame on {}", stream.name()),
            Arrival::Live => {
                let status = format!("connected: {}", self.settings.robot_id);
                self.presenter.set_text(Element::Status, &status);
            }
        }

        let surface = self.surfaces.get_mut(stream);
        if let StreamSlot::Socket(channel) = session.slot_mut(stream) {
            channel.on_frame(data, surface);
        }
    }

    fn on_render_confirmed(&mut self, stream: StreamKind, resource_id: u64) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let confirmed = match session.slot_mut(stream) {
            StreamSlot::Socket(channel) => channel.render_confirmed(resource_id),
            StreamSlot::Pull => false,
        };
        if confirmed && stream == StreamKind::Video && !session.first_render_seen {
            session.first_render_seen = true;
            log::info!("[video] live started: first video frame received");
        }
    }

    fn on_telemetry(&mut self, text: &str) {
        let now = Instant::now();
        let robot = self.settings.robot_id.clone();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        session.offline_reported = false;
        session.liveness.mark_live(now);
        self.presenter
            .set_text(Element::Status, &format!("connected: {}", robot));

        let Some(sample) = TelemetrySample::parse(text) else {
            log::debug!("[telemetry] dropped unparseable message");
            return;
        };
        let good = *session.smoother.apply(&sample);

        self.presenter
            .set_text(Element::Temperature, &format_reading(good.temperature_c));
        self.presenter
            .set_text(Element::Humidity, &format_reading(good.humidity));
        self.presenter
            .set_text(Element::Methane, &format_reading(good.methane_ppm));
        self.presenter
            .set_text(Element::Ammonia, &format_reading(good.ammonia_ppm));
        self.presenter
            .set_text(Element::Alcohol, &format_reading(good.alcohol_ppm));
        self.presenter.set_text(
            Element::LastUpdate,
            &last_update_label(sample.logical_ts(), Local::now()),
        );

        if self.recorder.on_sample(&sample, &good, &robot, Local::now()) {
            self.refresh_recording();
        }
    }

    fn on_liveness_tick(&mut self) {
        let now = Instant::now();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(reason) = session.liveness.check(now) else {
            return;
        };

        if !session.offline_reported {
            session.offline_reported = true;
            log::warn!("[liveness] robot offline: {:?}", reason);
        }
        for stream in [StreamKind::Video, StreamKind::Thermal] {
            let surface = self.surfaces.get_mut(stream);
            match session.slot_mut(stream) {
                StreamSlot::Socket(channel) => channel.reset(surface),
                StreamSlot::Pull => surface.clear(),
            }
        }
        self.set_status("robot offline");
    }

    fn on_input(&mut self, input: InputEvent) {
        match input {
            InputEvent::KeyDown { key, focus } => {
                let command = self
                    .session
                    .as_mut()
                    .and_then(|s| s.teleop.key_down(&key, focus));
                if let Some(command) = command {
                    self.send_drive(command);
                }
            }
            InputEvent::KeyUp { key, focus } => {
                let command = self
                    .session
                    .as_mut()
                    .and_then(|s| s.teleop.key_up(&key, focus));
                if let Some(command) = command {
                    self.send_drive(command);
                }
            }
            InputEvent::Button { direction, action } => {
                let command = self
                    .session
                    .as_mut()
                    .and_then(|s| s.teleop.button(direction, action));
                if let Some(command) = command {
                    self.send_drive(command);
                }
            }
            InputEvent::StopButton => self.send_drive(DriveCommand::Stop),
            InputEvent::SubmitText(text) => {
                match self.commands.send_text(&text) {
                    SendOutcome::Sent => log::info!("[command] command sent: {}", text.trim()),
                    SendOutcome::NotConnected => {
                        self.set_status("command socket not connected");
                        log::warn!("[command] command send failed: socket not connected");
                    }
                    SendOutcome::Empty => {}
                }
                self.refresh_command_log();
            }
            InputEvent::SetSpeed(value) => {
                self.commands.speed().set(value);
                self.presenter.set_text(Element::Speed, &value.to_string());
            }
            InputEvent::ToggleRecording => {
                let state = self.recorder.toggle();
                log::info!("[recorder] {:?}", state);
                self.refresh_recording();
            }
            InputEvent::ClearRecording => {
                self.recorder.clear();
                self.refresh_recording();
            }
            InputEvent::ExportCsv => {
                match self.recorder.write_csv(&self.export_dir, Local::now()) {
                    Ok(Some(path)) => log::info!("[recorder] exported {}", path.display()),
                    Ok(None) => log::info!("[recorder] nothing recorded yet"),
                    Err(e) => log::warn!("[recorder] export failed: {}", e),
                }
            }
            InputEvent::Connect => self.connect(),
            InputEvent::Disconnect => self.disconnect(),
            InputEvent::Quit => {}
        }
    }

    fn send_drive(&mut self, command: DriveCommand) {
        self.commands.send(command);
        self.refresh_command_log();
    }

    fn set_status(&mut self, text: &str) {
        self.presenter.set_text(Element::Status, text);
    }

    fn refresh_recording(&mut self) {
        let text = self.recorder.status_text();
        self.presenter.set_text(Element::RecordingStatus, &text);
    }

    fn refresh_command_log(&mut self) {
        let text = self.commands.log().render();
        self.presenter.set_text(Element::CommandLog, &text);
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn surface(&self, stream: StreamKind) -> &S {
        self.surfaces.get(stream)
    }

    pub fn recorder(&self) -> &SampleRecorder {
        &self.recorder
    }

    pub fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }
}
