//! Input state
//!
//! Owned by the application and fed from window events; nothing here is global.

use std::collections::HashSet;

use crate::window::{Event, MouseButton};

/// Keyboard and mouse state accumulated from window events
#[derive(Debug, Default)]
pub struct InputState {
    keys_down: HashSet<glfw::Key>,
    buttons_down: HashSet<MouseButton>,
    cursor: (f64, f64),
    scroll: (f64, f64),
    clicks: Vec<(MouseButton, f64, f64)>,
}

impl InputState {
    /// Create an empty input state
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one window event
    pub fn handle_event(&mut self, event: &Event) {
        match *event {
            Event::Key { key, pressed } => {
                if pressed {
                    self.keys_down.insert(key);
                } else {
                    self.keys_down.remove(&key);
                }
            }
            Event::MouseButton { button, pressed } => {
                if pressed {
                    if self.buttons_down.insert(button) {
                        self.clicks.push((button, self.cursor.0, self.cursor.1));
                    }
                } else {
                    self.buttons_down.remove(&button);
                }
            }
            Event::CursorMoved { x, y } => self.cursor = (x, y),
            Event::Scroll { dx, dy } => {
                self.scroll.0 += dx;
                self.scroll.1 += dy;
            }
            Event::Resized { .. } | Event::CloseRequested => {}
        }
    }

    /// Whether a key is held
    pub fn is_key_down(&self, key: glfw::Key) -> bool {
        self.keys_down.contains(&key)
    }

    /// Whether a mouse button is held
    pub fn is_button_down(&self, button: MouseButton) -> bool {
        self.buttons_down.contains(&button)
    }

    /// Last known cursor position
    pub fn cursor_position(&self) -> (f64, f64) {
        self.cursor
    }

    /// Take the scroll accumulated since the last call
    pub fn take_scroll(&mut self) -> (f64, f64) {
        std::mem::take(&mut self.scroll)
    }

    /// Take the press positions recorded since the last call
    pub fn take_clicks(&mut self) -> Vec<(MouseButton, f64, f64)> {
        std::mem::take(&mut self.clicks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_press_and_release() {
        let mut input = InputState::new();
        input.handle_event(&Event::Key { key: glfw::Key::W, pressed: true });
        assert!(input.is_key_down(glfw::Key::W));
        input.handle_event(&Event::Key { key: glfw::Key::W, pressed: false });
        assert!(!input.is_key_down(glfw::Key::W));
    }

    #[test]
    fn test_click_records_cursor_position_once() {
        let mut input = InputState::new();
        input.handle_event(&Event::CursorMoved { x: 12.0, y: 34.0 });
        input.handle_event(&Event::MouseButton { button: MouseButton::Left, pressed: true });
        input.handle_event(&Event::MouseButton { button: MouseButton::Left, pressed: true });
        assert!(input.is_button_down(MouseButton::Left));
        assert_eq!(input.take_clicks(), vec![(MouseButton::Left, 12.0, 34.0)]);
        assert!(input.take_clicks().is_empty());
    }

    #[test]
    fn test_scroll_accumulates_until_taken() {
        let mut input = InputState::new();
        input.handle_event(&Event::Scroll { dx: 0.0, dy: 1.0 });
        input.handle_event(&Event::Scroll { dx: 0.5, dy: 2.0 });
        assert_eq!(input.take_scroll(), (0.5, 3.0));
        assert_eq!(input.take_scroll(), (0.0, 0.0));
    }
}
