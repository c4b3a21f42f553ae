use std::collections::HashSet;

use crate::command::{Direction, DriveCommand};

/// Where keyboard focus sits when an input event arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Focus {
    #[default]
    Page,
    /// A text-entry field; drive keys are not ours to consume
    TextEntry,
}

/// Pointer and touch gestures on a hold-to-drive button
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    MouseDown,
    TouchStart,
    MouseUp,
    MouseLeave,
    TouchEnd,
    TouchCancel,
}

impl ButtonAction {
    pub fn is_press(self) -> bool {
        matches!(self, ButtonAction::MouseDown | ButtonAction::TouchStart)
    }
}

/// Per-direction UP/DOWN tracking that turns press/release events into start/stop commands.
///
/// Press only fires while the direction is UP, so key repeat cannot resend a start.
/// Release fires stop unconditionally.
#[derive(Debug, Default)]
pub struct TeleopInput {
    held: HashSet<Direction>,
}

impl TeleopInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_down(&mut self, key: &str, focus: Focus) -> Option<DriveCommand> {
        if focus == Focus::TextEntry {
            return None;
        }
        self.press(Direction::from_key(key)?)
    }

    pub fn key_up(&mut self, key: &str, focus: Focus) -> Option<DriveCommand> {
        if focus == Focus::TextEntry {
            return None;
        }
        Some(self.release(Direction::from_key(key)?))
    }

    pub fn button(&mut self, direction: Direction, action: ButtonAction) -> Option<DriveCommand> {
        if action.is_press() {
            self.press(direction)
        } else {
            Some(self.release(direction))
        }
    }

    pub fn press(&mut self, direction: Direction) -> Option<DriveCommand> {
        if self.held.insert(direction) {
            Some(direction.start())
        } else {
            None
        }
    }

    pub fn release(&mut self, direction: Direction) -> DriveCommand {
        self.held.remove(&direction);
        direction.stop()
    }

    pub fn is_held(&self, direction: Direction) -> bool {
        self.held.contains(&direction)
    }

    pub fn clear(&mut self) {
        self.held.clear();
    }
}
