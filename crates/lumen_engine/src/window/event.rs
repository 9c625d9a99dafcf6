//! Window events translated out of glfw

use glfw::{Action, WindowEvent};

/// Mouse buttons the editor reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    /// Primary button
    Left,
    /// Secondary button
    Right,
    /// Wheel button
    Middle,
}

/// Engine-level window event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Key pressed or released (repeats count as pressed)
    Key {
        /// Key code
        key: glfw::Key,
        /// Whether the key is now down
        pressed: bool,
    },
    /// Mouse button pressed or released
    MouseButton {
        /// Button
        button: MouseButton,
        /// Whether the button is now down
        pressed: bool,
    },
    /// Cursor moved, in screen coordinates relative to the window
    CursorMoved {
        /// Horizontal position
        x: f64,
        /// Vertical position
        y: f64,
    },
    /// Scroll wheel or trackpad
    Scroll {
        /// Horizontal offset
        dx: f64,
        /// Vertical offset
        dy: f64,
    },
    /// Framebuffer size changed
    Resized {
        /// New width in pixels
        width: u32,
        /// New height in pixels
        height: u32,
    },
    /// Window close requested
    CloseRequested,
}

impl Event {
    /// Translate a glfw event; events the engine ignores map to `None`
    pub fn from_glfw(event: &WindowEvent) -> Option<Self> {
        match *event {
            WindowEvent::Key(key, _, action, _) => Some(Self::Key {
                key,
                pressed: action != Action::Release,
            }),
            WindowEvent::MouseButton(button, action, _) => {
                let button = match button {
                    glfw::MouseButton::Button1 => MouseButton::Left,
                    glfw::MouseButton::Button2 => MouseButton::Right,
                    glfw::MouseButton::Button3 => MouseButton::Middle,
                    _ => return None,
                };
                Some(Self::MouseButton {
                    button,
                    pressed: action != Action::Release,
                })
            }
            WindowEvent::CursorPos(x, y) => Some(Self::CursorMoved { x, y }),
            WindowEvent::Scroll(dx, dy) => Some(Self::Scroll { dx, dy }),
            WindowEvent::FramebufferSize(width, height) => Some(Self::Resized {
                width: u32::try_from(width).unwrap_or(0),
                height: u32::try_from(height).unwrap_or(0),
            }),
            WindowEvent::Close => Some(Self::CloseRequested),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translates_release_and_repeat() {
        let release = WindowEvent::Key(glfw::Key::Space, 0, Action::Release, glfw::Modifiers::empty());
        let repeat = WindowEvent::Key(glfw::Key::Space, 0, Action::Repeat, glfw::Modifiers::empty());
        assert_eq!(
            Event::from_glfw(&release),
            Some(Event::Key { key: glfw::Key::Space, pressed: false })
        );
        assert_eq!(
            Event::from_glfw(&repeat),
            Some(Event::Key { key: glfw::Key::Space, pressed: true })
        );
    }

    #[test]
    fn test_negative_framebuffer_size_clamps_to_zero() {
        let event = WindowEvent::FramebufferSize(-1, 480);
        assert_eq!(Event::from_glfw(&event), Some(Event::Resized { width: 0, height: 480 }));
    }

    #[test]
    fn test_extra_mouse_buttons_are_ignored() {
        let event = WindowEvent::MouseButton(
            glfw::MouseButton::Button5,
            Action::Press,
            glfw::Modifiers::empty(),
        );
        assert_eq!(Event::from_glfw(&event), None);
    }
}
