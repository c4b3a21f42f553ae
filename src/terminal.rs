//! Keyboard front end: crossterm key events become [`InputEvent`]s.

use anyhow::Result;
use crossterm::event::{
    Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers,
    KeyboardEnhancementFlags, PopKeyboardEnhancementFlags, PushKeyboardEnhancementFlags,
};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, supports_keyboard_enhancement};
use crossterm::ExecutableCommand;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::io;
use tokio::sync::mpsc::UnboundedSender;

use crate::command::SpeedDial;
use crate::events::{InputEvent, LinkEvent};
use crate::teleop::Focus;

const SPEED_STEP: u8 = 10;

pub const HELP: &str = "w/a/s/d drive (hold)  space STOP  +/- speed  r record  z clear  e export  \
c connect  x disconnect  : command  q quit";

/// Restores the terminal when dropped
pub struct RawMode {
    enhanced: bool,
}

impl RawMode {
    pub fn enable() -> Result<Self> {
        enable_raw_mode()?;
        let enhanced = match supports_keyboard_enhancement() {
            Ok(true) => io::stdout()
                .execute(PushKeyboardEnhancementFlags(
                    KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                        | KeyboardEnhancementFlags::REPORT_EVENT_TYPES,
                ))
                .is_ok(),
            _ => false,
        };
        Ok(RawMode { enhanced })
    }

    /// Whether the terminal reports key releases
    pub fn reports_releases(&self) -> bool {
        self.enhanced
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if self.enhanced {
            let _ = io::stdout().execute(PopKeyboardEnhancementFlags);
        }
        let _ = disable_raw_mode();
    }
}

/// Key-to-input translation with a small text-entry mode for free-form commands.
pub struct KeyMapper {
    speed: SpeedDial,
    releases: bool,
    text: Option<String>,
    /// Drive keys pressed and not yet released. Without release reporting these stay latched
    /// until some other input lets go of them.
    held: BTreeSet<char>,
}

impl KeyMapper {
    pub fn new(speed: SpeedDial, releases: bool) -> Self {
        KeyMapper {
            speed,
            releases,
            text: None,
            held: BTreeSet::new(),
        }
    }

    pub fn focus(&self) -> Focus {
        if self.text.is_some() {
            Focus::TextEntry
        } else {
            Focus::Page
        }
    }

    pub fn pending_text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn translate(&mut self, key: KeyEvent) -> Vec<InputEvent> {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return vec![InputEvent::Quit];
        }
        if self.text.is_some() {
            return self.translate_text(key);
        }

        let KeyCode::Char(ch) = key.code else {
            return Vec::new();
        };
        let lower = ch.to_ascii_lowercase();

        if matches!(lower, 'w' | 'a' | 's' | 'd') {
            return self.translate_drive(lower, key.kind);
        }
        if key.kind != KeyEventKind::Press {
            return Vec::new();
        }

        match lower {
            ' ' => {
                // Keys still physically down report their own release later
                let mut out = if self.releases {
                    Vec::new()
                } else {
                    self.release_held()
                };
                out.push(InputEvent::StopButton);
                out
            }
            '+' | '=' => vec![InputEvent::SetSpeed(
                self.speed.get().saturating_add(SPEED_STEP),
            )],
            '-' | '_' => vec![InputEvent::SetSpeed(
                self.speed.get().saturating_sub(SPEED_STEP),
            )],
            'r' => vec![InputEvent::ToggleRecording],
            'z' => vec![InputEvent::ClearRecording],
            'e' => vec![InputEvent::ExportCsv],
            'c' => vec![InputEvent::Connect],
            'x' => vec![InputEvent::Disconnect],
            'q' => vec![InputEvent::Quit],
            ':' => {
                // Releases arriving while the entry has focus are ignored, so stop now
                let out = self.release_held();
                self.text = Some(String::new());
                out
            }
            _ => Vec::new(),
        }
    }

    fn translate_drive(&mut self, key: char, kind: KeyEventKind) -> Vec<InputEvent> {
        let name = key.to_string();
        match kind {
            KeyEventKind::Press | KeyEventKind::Repeat => {
                let mut out = Vec::new();
                if !self.releases {
                    // Pressing another direction releases the latched one
                    let others: Vec<char> =
                        self.held.iter().copied().filter(|c| *c != key).collect();
                    for c in others {
                        self.held.remove(&c);
                        out.push(InputEvent::KeyUp {
                            key: c.to_string(),
                            focus: Focus::Page,
                        });
                    }
                }
                self.held.insert(key);
                out.push(InputEvent::KeyDown {
                    key: name,
                    focus: Focus::Page,
                });
                out
            }
            KeyEventKind::Release => {
                self.held.remove(&key);
                vec![InputEvent::KeyUp {
                    key: name,
                    focus: Focus::Page,
                }]
            }
        }
    }

    fn release_held(&mut self) -> Vec<InputEvent> {
        std::mem::take(&mut self.held)
            .into_iter()
            .map(|c| InputEvent::KeyUp {
                key: c.to_string(),
                focus: Focus::Page,
            })
            .collect()
    }

    fn translate_text(&mut self, key: KeyEvent) -> Vec<InputEvent> {
        let Some(text) = self.text.as_mut() else {
            return Vec::new();
        };
        // Key events still reach the page while the entry has focus
        if let KeyCode::Char(ch) = key.code {
            let name = ch.to_string();
            return match key.kind {
                KeyEventKind::Release => vec![InputEvent::KeyUp {
                    key: name,
                    focus: Focus::TextEntry,
                }],
                _ => {
                    text.push(ch);
                    vec![InputEvent::KeyDown {
                        key: name,
                        focus: Focus::TextEntry,
                    }]
                }
            };
        }
        if key.kind == KeyEventKind::Release {
            return Vec::new();
        }

        match key.code {
            KeyCode::Backspace => {
                text.pop();
                Vec::new()
            }
            KeyCode::Enter => {
                let submitted = std::mem::take(text);
                self.text = None;
                vec![InputEvent::SubmitText(submitted)]
            }
            KeyCode::Esc => {
                self.text = None;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

/// Read the terminal until quit, forwarding inputs to the session loop.
pub async fn forward_keys(events: UnboundedSender<LinkEvent>, mut mapper: KeyMapper) -> Result<()> {
    let mut reader = EventStream::new();
    while let Some(event) = reader.next().await {
        let Event::Key(key) = event? else {
            continue;
        };
        for input in mapper.translate(key) {
            let quit = input == InputEvent::Quit;
            if events.send(LinkEvent::Input(input)).is_err() || quit {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    fn key(code: KeyCode, kind: KeyEventKind) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind,
            state: KeyEventState::NONE,
        }
    }

    fn press(ch: char) -> KeyEvent {
        key(KeyCode::Char(ch), KeyEventKind::Press)
    }

    fn down(k: &str) -> InputEvent {
        InputEvent::KeyDown {
            key: k.to_string(),
            focus: Focus::Page,
        }
    }

    fn up(k: &str) -> InputEvent {
        InputEvent::KeyUp {
            key: k.to_string(),
            focus: Focus::Page,
        }
    }

    #[test]
    fn test_drive_keys_with_release_reporting() {
        let mut mapper = KeyMapper::new(SpeedDial::default(), true);
        assert_eq!(mapper.translate(press('W')), vec![down("w")]);
        assert_eq!(
            mapper.translate(key(KeyCode::Char('w'), KeyEventKind::Repeat)),
            vec![down("w")]
        );
        assert_eq!(
            mapper.translate(key(KeyCode::Char('w'), KeyEventKind::Release)),
            vec![up("w")]
        );
    }

    #[test]
    fn test_latching_without_release_reporting() {
        let mut mapper = KeyMapper::new(SpeedDial::default(), false);
        assert_eq!(mapper.translate(press('w')), vec![down("w")]);
        assert_eq!(mapper.translate(press('a')), vec![up("w"), down("a")]);
        assert_eq!(
            mapper.translate(press(' ')),
            vec![up("a"), InputEvent::StopButton]
        );
        assert_eq!(mapper.translate(press(' ')), vec![InputEvent::StopButton]);
    }

    #[test]
    fn test_text_mode_releases_held_keys() {
        let mut mapper = KeyMapper::new(SpeedDial::default(), true);
        mapper.translate(press('w'));
        mapper.translate(press('d'));
        mapper.translate(key(KeyCode::Char('d'), KeyEventKind::Release));

        assert_eq!(mapper.translate(press(':')), vec![up("w")]);
        assert_eq!(mapper.focus(), Focus::TextEntry);
        // The physical release now arrives with the entry focused
        assert_eq!(
            mapper.translate(key(KeyCode::Char('w'), KeyEventKind::Release)),
            vec![InputEvent::KeyUp {
                key: "w".into(),
                focus: Focus::TextEntry
            }]
        );

        let mut latching = KeyMapper::new(SpeedDial::default(), false);
        latching.translate(press('s'));
        assert_eq!(latching.translate(press(':')), vec![up("s")]);
    }

    #[test]
    fn test_space_keeps_reported_keys_held() {
        let mut mapper = KeyMapper::new(SpeedDial::default(), true);
        mapper.translate(press('a'));
        assert_eq!(mapper.translate(press(' ')), vec![InputEvent::StopButton]);
        assert_eq!(
            mapper.translate(key(KeyCode::Char('a'), KeyEventKind::Release)),
            vec![up("a")]
        );
        assert!(mapper.translate(press(':')).is_empty());
    }

    #[test]
    fn test_speed_steps_saturate() {
        let dial = SpeedDial::new(250);
        let mut mapper = KeyMapper::new(dial.clone(), true);
        assert_eq!(mapper.translate(press('+')), vec![InputEvent::SetSpeed(255)]);
        dial.set(5);
        assert_eq!(mapper.translate(press('-')), vec![InputEvent::SetSpeed(0)]);
    }

    #[test]
    fn test_text_entry_mode() {
        let mut mapper = KeyMapper::new(SpeedDial::default(), true);
        assert!(mapper.translate(press(':')).is_empty());
        assert_eq!(mapper.focus(), Focus::TextEntry);

        assert_eq!(
            mapper.translate(press('w')),
            vec![InputEvent::KeyDown {
                key: "w".into(),
                focus: Focus::TextEntry
            }]
        );
        mapper.translate(press('x'));
        mapper.translate(press('y'));
        mapper.translate(key(KeyCode::Backspace, KeyEventKind::Press));
        assert_eq!(mapper.pending_text(), Some("wx"));

        assert_eq!(
            mapper.translate(key(KeyCode::Enter, KeyEventKind::Press)),
            vec![InputEvent::SubmitText("wx".into())]
        );
        assert_eq!(mapper.focus(), Focus::Page);
    }

    #[test]
    fn test_escape_and_quit() {
        let mut mapper = KeyMapper::new(SpeedDial::default(), true);
        mapper.translate(press(':'));
        mapper.translate(press('q'));
        assert!(mapper.translate(key(KeyCode::Esc, KeyEventKind::Press)).is_empty());
        assert_eq!(mapper.pending_text(), None);

        assert_eq!(mapper.translate(press('q')), vec![InputEvent::Quit]);
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(mapper.translate(ctrl_c), vec![InputEvent::Quit]);
    }

    #[test]
    fn test_release_of_command_keys_ignored() {
        let mut mapper = KeyMapper::new(SpeedDial::default(), true);
        assert!(mapper
            .translate(key(KeyCode::Char('r'), KeyEventKind::Release))
            .is_empty());
    }
}
