use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Key names scripts receive in `on_key_pressed` / `on_key_released`.
const KEY_NAMES: &[&str] = &[
    "backspace", "tab", "clear", "return", "pause", "escape", "space", "!", "\"", "#", "$", "&",
    "'", "(", ")", "*", "+", ",", "-", ".", "/", "0", "1", "2", "3", "4", "5", "6", "7", "8", "9",
    ":", ";", "<", "=", ">", "?", "@", "[", "\\", "]", "^", "_", "`", "a", "b", "c", "d", "e",
    "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p", "q", "r", "s", "t", "u", "v", "w", "x",
    "y", "z", "delete", "kp 0", "kp 1", "kp 2", "kp 3", "kp 4", "kp 5", "kp 6", "kp 7", "kp 8",
    "kp 9", "kp .", "kp /", "kp *", "kp -", "kp +", "kp return", "kp =", "up", "down", "right",
    "left", "insert", "home", "end", "page up", "page down", "f1", "f2", "f3", "f4", "f5", "f6",
    "f7", "f8", "f9", "f10", "f11", "f12", "f13", "f14", "f15", "num lock", "caps lock",
    "scroll lock", "right shift", "left shift", "right control", "left control", "right alt",
    "left alt", "right meta", "left meta", "right windows", "left windows",
];

pub fn is_known_key(name: &str) -> bool {
    KEY_NAMES.contains(&name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Modifiers {
    pub shift: bool,
    pub control: bool,
    pub alt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputEvent {
    KeyPressed {
        key: String,
        #[serde(default)]
        modifiers: Modifiers,
    },
    KeyReleased {
        key: String,
    },
    WindowClosing,
}

impl InputEvent {
    pub fn is_window_closing(&self) -> bool {
        matches!(self, InputEvent::WindowClosing)
    }

    pub fn is_key_pressed(&self, name: &str) -> bool {
        matches!(self, InputEvent::KeyPressed { key, .. } if key == name)
    }
}

/// Where the main loop takes its input from, at most one event per frame.
pub trait InputSource {
    fn poll(&mut self, frame: u64) -> Option<InputEvent>;
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptedEvent {
    frame: u64,
    event: InputEvent,
}

/// Replays a JSON list of `{ "frame": N, "event": { "kind": ... } }`
/// entries. Events due on the same frame are delivered on consecutive
/// frames.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    pending: VecDeque<ScriptedEvent>,
}

impl ScriptedInput {
    pub fn from_json(text: &str) -> Result<Self> {
        let mut events: Vec<ScriptedEvent> =
            serde_json::from_str(text).context("parsing input script")?;
        events.sort_by_key(|event| event.frame);
        Ok(Self {
            pending: events.into(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading input script {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl InputSource for ScriptedInput {
    fn poll(&mut self, frame: u64) -> Option<InputEvent> {
        if self.pending.front()?.frame > frame {
            return None;
        }
        self.pending.pop_front().map(|scripted| scripted.event)
    }
}
