use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;

use crate::input::{InputEvent, InputSource};
use crate::lua_host::{EngineRunSummary, LuaContext};

pub const DEFAULT_FRAME_MS: u64 = 25;

#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    pub frame_ms: u64,
    /// Stop after this many frames even if nothing asked to quit.
    pub max_frames: Option<u64>,
    /// Sleep between frames instead of running as fast as possible.
    pub realtime: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            frame_ms: DEFAULT_FRAME_MS,
            max_frames: None,
            realtime: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    WindowClosed,
    EscapePressed,
    ScriptRequested,
    FrameLimit,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopReport {
    pub frames: u64,
    pub elapsed_ms: u64,
    pub reason: ExitReason,
    pub summary: EngineRunSummary,
}

/// Fixed-step frame loop around the script engine. Virtual time advances by
/// `frame_ms` per frame whether or not the loop runs in real time.
pub struct MainLoop {
    engine: LuaContext,
    options: LoopOptions,
    frame: u64,
    now: u64,
    exit_reason: Option<ExitReason>,
}

impl MainLoop {
    pub fn new(engine: LuaContext, options: LoopOptions) -> Self {
        Self {
            engine,
            options,
            frame: 0,
            now: 0,
            exit_reason: None,
        }
    }

    pub fn run(mut self, input: &mut dyn InputSource) -> Result<LoopReport> {
        let reason = loop {
            if let Some(reason) = self.exit_reason {
                break reason;
            }
            if self
                .options
                .max_frames
                .is_some_and(|limit| self.frame >= limit)
            {
                break ExitReason::FrameLimit;
            }
            let started = Instant::now();
            self.step(input)?;
            if self.options.realtime {
                let budget = Duration::from_millis(self.options.frame_ms);
                if let Some(rest) = budget.checked_sub(started.elapsed()) {
                    thread::sleep(rest);
                }
            }
        };
        log::info!(
            "main loop stopped after {} frames ({reason:?})",
            self.frame
        );
        self.engine.exit()?;
        Ok(LoopReport {
            frames: self.frame,
            elapsed_ms: self.now,
            reason,
            summary: self.engine.summary(),
        })
    }

    /// Input, update, draw: one frame.
    fn step(&mut self, input: &mut dyn InputSource) -> Result<()> {
        if let Some(event) = input.poll(self.frame) {
            self.notify_input(&event)?;
        }
        self.now += self.options.frame_ms;
        self.engine.update(self.now)?;
        if self.engine.is_exit_requested() && self.exit_reason.is_none() {
            self.exit_reason = Some(ExitReason::ScriptRequested);
        }
        self.engine.draw()?;
        self.frame += 1;
        Ok(())
    }

    fn notify_input(&mut self, event: &InputEvent) -> Result<()> {
        if event.is_window_closing() {
            self.exit_reason = Some(ExitReason::WindowClosed);
        } else if event.is_key_pressed("escape") {
            self.exit_reason = Some(ExitReason::EscapePressed);
        }
        let handled = self.engine.notify_input(event)?;
        log::trace!("input {event:?} handled: {handled}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::backend::{RecordingAudio, RecordingRenderer};
    use crate::input::ScriptedInput;
    use crate::lua_host::EngineServices;
    use kq_data::DataStore;

    fn engine(main_lua: &str) -> LuaContext {
        LuaContext::new(EngineServices {
            renderer: Rc::new(RecordingRenderer::new((320, 240))),
            audio: Rc::new(RecordingAudio::new(["ok"])),
            data: DataStore::from_memory([("main.lua", main_lua.as_bytes().to_vec())]),
        })
        .unwrap()
    }

    #[test]
    fn frame_limit_stops_an_idle_quest() {
        let options = LoopOptions {
            max_frames: Some(4),
            ..LoopOptions::default()
        };
        let report = MainLoop::new(engine(""), options)
            .run(&mut ScriptedInput::default())
            .unwrap();
        assert_eq!(report.frames, 4);
        assert_eq!(report.elapsed_ms, 100);
        assert_eq!(report.reason, ExitReason::FrameLimit);
    }

    #[test]
    fn escape_still_reaches_scripts_before_quitting() {
        let mut input = ScriptedInput::from_json(
            r#"[{ "frame": 2, "event": { "kind": "key_pressed", "key": "escape" } }]"#,
        )
        .unwrap();
        let report = MainLoop::new(
            engine("function kq.main:on_key_pressed(key) kq.main.last_key = key end"),
            LoopOptions::default(),
        )
        .run(&mut input)
        .unwrap();
        assert_eq!(report.reason, ExitReason::EscapePressed);
        assert_eq!(report.frames, 3);
    }

    #[test]
    fn scripts_can_end_the_loop() {
        let report = MainLoop::new(
            engine("function kq.main:on_started() kq.timer.start(60, kq.main.exit) end"),
            LoopOptions {
                max_frames: Some(100),
                ..LoopOptions::default()
            },
        )
        .run(&mut ScriptedInput::default())
        .unwrap();
        assert_eq!(report.reason, ExitReason::ScriptRequested);
        assert_eq!(report.elapsed_ms, 75);
        assert!(report
            .summary
            .events()
            .iter()
            .any(|event| event == "main.finished"));
    }
}
