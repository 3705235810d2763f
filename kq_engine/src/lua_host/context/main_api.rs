use anyhow::Result;
use kq_data::StringResource;
use mlua::{Function, Lua, Result as LuaResult, Table, Value, Variadic};

use super::args::Args;
use super::errors::BridgeError;
use super::ContextRef;
use crate::settings::{Settings, SETTINGS_FILE};

/// Compiles a quest script, trying `name` and then `name.lua`. A script
/// that does not exist yields `None`.
pub(crate) fn load_script<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    name: &str,
) -> LuaResult<Option<Function<'lua>>> {
    let found = {
        let ctx = context.borrow();
        let file = [name.to_string(), format!("{name}.lua")]
            .into_iter()
            .find(|candidate| ctx.data.exists(candidate));
        match file {
            Some(file) => {
                let bytes = ctx
                    .data
                    .read(&file)
                    .map_err(|err| mlua::Error::RuntimeError(format!("{err:#}")))?;
                Some((file, bytes))
            }
            None => None,
        }
    };
    let Some((file, bytes)) = found else {
        return Ok(None);
    };
    lua.load(bytes).set_name(file).into_function().map(Some)
}

fn settings_name(args: &Args) -> LuaResult<String> {
    Ok(args
        .opt_string(1)?
        .unwrap_or_else(|| SETTINGS_FILE.to_string()))
}

/// Reads a settings file from the quest write directory and applies it.
/// Returns whether a file was found.
fn load_settings(context: &ContextRef, file: &str) -> LuaResult<bool> {
    let mut ctx = context.borrow_mut();
    if ctx.data.write_dir().is_none() {
        log::error!("Cannot load {file}: no write directory was specified in quest.dat");
        return Ok(false);
    }
    let bytes = match ctx.data.read_optional(file) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Ok(false),
        Err(err) => {
            log::warn!("Cannot read {file}: {err:#}");
            return Ok(false);
        }
    };
    let settings = String::from_utf8(bytes)
        .map_err(anyhow::Error::from)
        .and_then(|text| Settings::parse(&text, file));
    let settings = match settings {
        Ok(settings) => settings,
        Err(err) => {
            log::warn!("Ignoring {file}: {err:#}");
            return Ok(false);
        }
    };

    if let Some(mode) = &settings.video_mode {
        if !ctx.renderer.set_video_mode(mode) {
            log::warn!("{file}: unknown video mode '{mode}'");
        }
    }
    if let Some(volume) = settings.sound_volume {
        ctx.audio.set_volume(volume);
    }
    if let Some(volume) = settings.music_volume {
        ctx.audio.set_music_volume(volume);
    }
    if let Some(language) = settings.language {
        ctx.data.set_language(Some(language));
        match StringResource::load(&ctx.data) {
            Ok(strings) => ctx.strings = strings,
            Err(err) => log::warn!("Cannot load strings for the new language: {err:#}"),
        }
    }
    ctx.log_event(format!("settings.load {file}"));
    Ok(true)
}

fn save_settings(context: &ContextRef, file: &str) -> LuaResult<bool> {
    let mut ctx = context.borrow_mut();
    if ctx.data.write_dir().is_none() {
        return Err(BridgeError::NoWriteDir.into());
    }
    let settings = Settings {
        video_mode: Some(ctx.renderer.video_mode()),
        sound_volume: Some(ctx.audio.volume()),
        music_volume: Some(ctx.audio.music_volume()),
        language: ctx.data.language().map(str::to_string),
    };
    match ctx.data.save(file, settings.to_data_file().as_bytes()) {
        Ok(path) => {
            log::debug!("saved settings to {}", path.display());
            ctx.log_event(format!("settings.save {file}"));
            Ok(true)
        }
        Err(err) => {
            log::warn!("Cannot save {file}: {err:#}");
            Ok(false)
        }
    }
}

/// Installs `kq.main`. The table doubles as the main context: quest scripts
/// define its `on_*` events.
pub(crate) fn install_main_module(lua: &Lua, context: &ContextRef, kq: &Table) -> Result<()> {
    let main = lua.create_table()?;

    let load_context = context.clone();
    main.set(
        "load_file",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("load_file", values);
            let name = args.check_string(1)?;
            load_script(lua, &load_context, &name)
        })?,
    )?;

    let do_context = context.clone();
    main.set(
        "do_file",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("do_file", values);
            let name = args.check_string(1)?;
            let chunk = load_script(lua, &do_context, &name)?
                .ok_or(BridgeError::MissingScript(name))?;
            chunk.call::<_, ()>(())
        })?,
    )?;

    let exit_context = context.clone();
    main.set(
        "exit",
        lua.create_function(move |_, ()| {
            let mut ctx = exit_context.borrow_mut();
            ctx.exit_requested = true;
            ctx.log_event("main.exit");
            Ok(())
        })?,
    )?;

    let write_dir_context = context.clone();
    main.set(
        "get_quest_write_dir",
        lua.create_function(move |_, ()| {
            Ok(write_dir_context
                .borrow()
                .data
                .quest_write_dir()
                .map(str::to_string))
        })?,
    )?;

    let load_settings_context = context.clone();
    main.set(
        "load_settings",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("load_settings", values);
            load_settings(&load_settings_context, &settings_name(&args)?)
        })?,
    )?;

    let save_settings_context = context.clone();
    main.set(
        "save_settings",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("save_settings", values);
            save_settings(&save_settings_context, &settings_name(&args)?)
        })?,
    )?;

    let time_context = context.clone();
    main.set(
        "get_elapsed_time",
        lua.create_function(move |_, ()| Ok(time_context.borrow().now))?,
    )?;

    kq.set("main", main.clone())?;
    context.borrow_mut().set_main_table(lua, main)?;
    Ok(())
}

pub(crate) fn install_audio_module(lua: &Lua, context: &ContextRef, kq: &Table) -> Result<()> {
    let audio = lua.create_table()?;

    let play_context = context.clone();
    audio.set(
        "play_sound",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("play_sound", values);
            let id = args.check_string(1)?;
            let backend = play_context.borrow().audio.clone();
            if !backend.sound_exists(&id) {
                return Err(BridgeError::MissingSound(id).into());
            }
            backend.play_sound(&id);
            Ok(())
        })?,
    )?;

    let preload_context = context.clone();
    audio.set(
        "preload_sounds",
        lua.create_function(move |_, ()| {
            preload_context.borrow().audio.preload_sounds();
            Ok(())
        })?,
    )?;

    let get_volume_context = context.clone();
    audio.set(
        "get_volume",
        lua.create_function(move |_, ()| Ok(get_volume_context.borrow().audio.volume()))?,
    )?;

    let set_volume_context = context.clone();
    audio.set(
        "set_volume",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("set_volume", values);
            let volume = args.check_integer(1)?;
            let volume = volume.clamp(0, 100) as i32;
            set_volume_context.borrow().audio.set_volume(volume);
            Ok(())
        })?,
    )?;

    kq.set("audio", audio)?;
    Ok(())
}

/// Appends a searcher to `package.loaders` so that `require` finds quest
/// scripts in the resource store once the standard searchers gave up.
pub(crate) fn install_loader(lua: &Lua, context: &ContextRef) -> Result<()> {
    let loader_context = context.clone();
    let loader = lua.create_function(move |lua, module: String| {
        let name = module.replace('.', "/");
        match load_script(lua, &loader_context, &name)? {
            Some(chunk) => Ok(Value::Function(chunk)),
            None => Ok(Value::String(
                lua.create_string(format!("\n\tno quest file '{name}'"))?,
            )),
        }
    })?;
    let package: Table = lua.globals().get("package")?;
    let loaders: Table = package.get("loaders")?;
    loaders.raw_set(loaders.raw_len() + 1, loader)?;
    Ok(())
}
