use std::{fs, path::Path, rc::Rc};

use anyhow::{Context, Result};
use kq_data::DataStore;
use serde::Serialize;

use crate::backend::{RecordingAudio, RecordingRenderer};
use crate::cli::RunArgs;
use crate::input::ScriptedInput;
use crate::lua_host::{EngineServices, LuaContext};
use crate::main_loop::{LoopOptions, MainLoop};
use crate::quest::QuestProperties;

pub const SCREEN_SIZE: (u32, u32) = (320, 240);
const SOUNDS_DIR: &str = "sounds/";

/// Sound ids the quest ships: file names under `sounds/` without extension.
fn sound_ids(data: &DataStore) -> Vec<String> {
    data.list(SOUNDS_DIR)
        .into_iter()
        .filter_map(|name| {
            let id = name.strip_prefix(SOUNDS_DIR)?;
            let id = id.rsplit_once('.').map_or(id, |(stem, _)| stem);
            Some(id.to_string())
        })
        .collect()
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T, label: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("serializing {label} to JSON"))?;
    fs::write(path, &json).with_context(|| format!("writing {label} to {}", path.display()))?;
    println!("Saved {label} to {}", path.display());
    Ok(())
}

pub fn execute(args: RunArgs) -> Result<()> {
    let RunArgs {
        data_root,
        write_root,
        frames,
        frame_ms,
        realtime,
        input_script,
        event_log_json,
        render_log_json,
        audio_log_json,
        verbose: _,
    } = args;

    if frames.is_none() && !realtime && input_script.is_none() {
        log::warn!("no --frames limit: the loop runs until a script ends it");
    }

    let mut data = DataStore::open(&data_root)
        .with_context(|| format!("opening quest data at {}", data_root.display()))?;
    let quest = QuestProperties::load(&data)
        .with_context(|| format!("loading quest properties from {}", data.describe()))?;
    match write_root {
        Some(root) => data.set_write_root(root),
        None => log::info!("no --write-root given; settings cannot be saved"),
    }
    data.set_quest_write_dir(quest.write_dir.clone());
    if let Some(title) = quest.title_bar.as_deref() {
        log::info!("starting quest \"{title}\" from {}", data.describe());
    }

    let renderer = RecordingRenderer::new(SCREEN_SIZE);
    let audio = RecordingAudio::new(sound_ids(&data));
    let engine = LuaContext::new(EngineServices {
        renderer: Rc::new(renderer.clone()),
        audio: Rc::new(audio.clone()),
        data,
    })?;

    let mut input = match input_script.as_deref() {
        Some(path) => ScriptedInput::load(path)?,
        None => ScriptedInput::default(),
    };
    let options = LoopOptions {
        frame_ms,
        max_frames: frames,
        realtime,
    };
    let report = MainLoop::new(engine, options).run(&mut input)?;

    println!(
        "Ran {} frames ({} ms simulated), stopped by {:?}",
        report.frames, report.elapsed_ms, report.reason
    );
    println!(
        "Objects -> destroyed: {} | still alive: {}",
        report.summary.destroyed_objects(),
        report.summary.live_objects()
    );

    if let Some(path) = event_log_json.as_deref() {
        write_json(path, &report, "engine event log")?;
    }
    if let Some(path) = render_log_json.as_deref() {
        write_json(path, &renderer.events(), "render log")?;
    }
    if let Some(path) = audio_log_json.as_deref() {
        write_json(path, &audio.events(), "audio log")?;
    }
    Ok(())
}
