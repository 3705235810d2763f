use anyhow::{Context, Result};
use mlua::Lua;
use serde::Serialize;

pub const SETTINGS_FILE: &str = "settings.dat";

/// User preferences persisted in the quest write directory as a Lua data
/// file of plain assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub video_mode: Option<String>,
    pub sound_volume: Option<i32>,
    pub music_volume: Option<i32>,
    pub language: Option<String>,
}

impl Settings {
    /// Runs the file in an empty environment and picks up the known globals.
    pub fn parse(text: &str, name: &str) -> Result<Self> {
        let lua = Lua::new();
        let env = lua.create_table()?;
        lua.load(text)
            .set_name(name)
            .set_environment(env.clone())
            .exec()
            .with_context(|| format!("reading settings file {name}"))?;
        Ok(Self {
            video_mode: env
                .get("video_mode")
                .with_context(|| format!("{name}: video_mode must be a string"))?,
            sound_volume: env
                .get("sound_volume")
                .with_context(|| format!("{name}: sound_volume must be a number"))?,
            music_volume: env
                .get("music_volume")
                .with_context(|| format!("{name}: music_volume must be a number"))?,
            language: env
                .get("language")
                .with_context(|| format!("{name}: language must be a string"))?,
        })
    }

    pub fn to_data_file(&self) -> String {
        let mut text = String::new();
        if let Some(mode) = &self.video_mode {
            text.push_str(&format!("video_mode = {mode:?}\n"));
        }
        if let Some(volume) = self.sound_volume {
            text.push_str(&format!("sound_volume = {volume}\n"));
        }
        if let Some(volume) = self.music_volume {
            text.push_str(&format!("music_volume = {volume}\n"));
        }
        if let Some(language) = &self.language {
            text.push_str(&format!("language = {language:?}\n"));
        }
        text
    }
}
