use anyhow::Result;
use mlua::{AnyUserData, Lua, Table, Value, Variadic};

use super::args::Args;
use super::drawables::{install_drawable_methods, register_drawable, Drawable, DrawableKind};
use super::errors::BridgeError;
use super::handles::expose;
use super::scriptable::{NativeObject, ObjectId, TypeTag};
use super::ContextRef;
use crate::backend::{Color, Rect};

/// Directory of quest images that `kq.surface.create(file)` reads from.
const SPRITES_DIR: &str = "sprites";

/// Off-screen image. Pixels stay in the render backend; this side only knows
/// the size and what was last put there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Surface {
    width: u32,
    height: u32,
    fill: Option<Color>,
    source: Option<String>,
}

impl Surface {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fill: None,
            source: None,
        }
    }

    pub(crate) fn from_image(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            source: Some(name.into()),
            ..Self::new(width, height)
        }
    }

    pub(crate) fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[cfg(test)]
    pub(crate) fn fill_color(&self) -> Option<Color> {
        self.fill
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn set_fill_color(&mut self, color: Color) {
        self.fill = Some(color);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenderingMode {
    Solid,
    Antialiasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HorizontalAlignment {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerticalAlignment {
    Top,
    Middle,
    Bottom,
}

const RENDERING_MODES: [(&str, RenderingMode); 2] = [
    ("solid", RenderingMode::Solid),
    ("antialiasing", RenderingMode::Antialiasing),
];

const HORIZONTAL_ALIGNMENTS: [(&str, HorizontalAlignment); 3] = [
    ("left", HorizontalAlignment::Left),
    ("center", HorizontalAlignment::Center),
    ("right", HorizontalAlignment::Right),
];

const VERTICAL_ALIGNMENTS: [(&str, VerticalAlignment); 3] = [
    ("top", VerticalAlignment::Top),
    ("middle", VerticalAlignment::Middle),
    ("bottom", VerticalAlignment::Bottom),
];

/// A single line of text drawn with one font and one color. Its position is
/// the anchor point the alignments refer to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TextSurface {
    font: Option<String>,
    rendering_mode: RenderingMode,
    horizontal_alignment: HorizontalAlignment,
    vertical_alignment: VerticalAlignment,
    color: Color,
    text: String,
}

impl Default for TextSurface {
    fn default() -> Self {
        Self {
            font: None,
            rendering_mode: RenderingMode::Solid,
            horizontal_alignment: HorizontalAlignment::Left,
            vertical_alignment: VerticalAlignment::Middle,
            color: Color::WHITE,
            text: String::new(),
        }
    }
}

impl TextSurface {
    pub(crate) fn font(&self) -> Option<&str> {
        self.font.as_deref()
    }

    pub(crate) fn rendering_mode(&self) -> RenderingMode {
        self.rendering_mode
    }

    pub(crate) fn color(&self) -> Color {
        self.color
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Top-left corner of a `width` x `height` text box anchored at `(x, y)`.
    pub(crate) fn anchor(&self, x: i32, y: i32, width: u32, height: u32) -> (i32, i32) {
        let (width, height) = (width as i32, height as i32);
        let x = match self.horizontal_alignment {
            HorizontalAlignment::Left => x,
            HorizontalAlignment::Center => x - width / 2,
            HorizontalAlignment::Right => x - width,
        };
        let y = match self.vertical_alignment {
            VerticalAlignment::Top => y,
            VerticalAlignment::Middle => y - height / 2,
            VerticalAlignment::Bottom => y - height,
        };
        (x, y)
    }
}

/// Registers a freshly built drawable and hands its handle to the script.
fn push_new_drawable<'lua>(
    lua: &'lua Lua,
    context: &ContextRef,
    drawable: Drawable,
) -> mlua::Result<AnyUserData<'lua>> {
    let id = {
        let mut ctx = context.borrow_mut();
        let tag = drawable.type_tag();
        let id = ctx.objects.insert(NativeObject::Drawable(drawable));
        register_drawable(&mut ctx, id);
        ctx.log_event(format!("object.create {} {id}", tag.module_name()));
        id
    };
    expose(lua, context, id)
}

fn surface_mut<'a>(
    ctx: &'a mut super::EngineContext,
    id: ObjectId,
) -> mlua::Result<&'a mut Surface> {
    match ctx.objects.drawable_mut(id).map(Drawable::kind_mut) {
        Some(DrawableKind::Surface(surface)) => Ok(surface),
        _ => Err(BridgeError::StaleObject(id).into()),
    }
}

fn text_surface_mut<'a>(
    ctx: &'a mut super::EngineContext,
    id: ObjectId,
) -> mlua::Result<&'a mut TextSurface> {
    match ctx.objects.drawable_mut(id).map(Drawable::kind_mut) {
        Some(DrawableKind::Text(text)) => Ok(text),
        _ => Err(BridgeError::StaleObject(id).into()),
    }
}

/// Loads `sprites/<file>` (or its language-specific variant) far enough to
/// know its size. Missing or undecodable images are reported, not raised.
fn load_surface_image(
    context: &ContextRef,
    file: &str,
    language_specific: bool,
) -> Option<Surface> {
    let ctx = context.borrow();
    let relative = format!("{SPRITES_DIR}/{file}");
    let loaded = ctx
        .data
        .resolve_name(&relative, language_specific)
        .and_then(|name| {
            let bytes = ctx.data.read(&name)?;
            let size = ctx.renderer.load_image(&name, &bytes)?;
            Ok((name, size))
        });
    match loaded {
        Ok((name, (width, height))) => Some(Surface::from_image(name, width, height)),
        Err(err) => {
            log::warn!("Cannot load image '{relative}': {err:#}");
            None
        }
    }
}

pub(crate) fn install_surface_module(lua: &Lua, context: &ContextRef, kq: &Table) -> Result<()> {
    let module = lua.create_table()?;

    let create_context = context.clone();
    module.set(
        "create",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("create", values);
            let surface = if args.len() == 0 {
                let (width, height) = create_context.borrow().renderer.screen_size();
                Surface::new(width, height)
            } else if args.is_number(1) {
                Surface::new(args.check_size(1)?, args.check_size(2)?)
            } else if matches!(args.get(1), Value::String(_)) {
                let file = args.check_string(1)?;
                let language_specific = args.opt_bool(2, false);
                match load_surface_image(&create_context, &file, language_specific) {
                    Some(surface) => surface,
                    None => return Ok(Value::Nil),
                }
            } else {
                return Err(args.bad_type(1, "number, string or no value").into());
            };
            let handle = push_new_drawable(lua, &create_context, Drawable::surface(surface))?;
            Ok(Value::UserData(handle))
        })?,
    )?;

    let size_context = context.clone();
    module.set(
        "get_size",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("get_size", values);
            let id = args.check_object(1, TypeTag::Surface)?;
            let mut ctx = size_context.borrow_mut();
            let (width, height) = surface_mut(&mut ctx, id)?.size();
            Ok((width, height))
        })?,
    )?;

    let fill_context = context.clone();
    module.set(
        "fill_color",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("fill_color", values);
            let id = args.check_object(1, TypeTag::Surface)?;
            let color = args.check_color(2)?;
            let area = if args.len() >= 3 {
                Some(Rect {
                    x: args.check_position(3)?,
                    y: args.check_position(4)?,
                    width: args.check_size(5)?,
                    height: args.check_size(6)?,
                })
            } else {
                None
            };
            let mut ctx = fill_context.borrow_mut();
            let surface = surface_mut(&mut ctx, id)?;
            if area.is_none() {
                surface.set_fill_color(color);
            }
            ctx.renderer.fill(id.raw(), color, area);
            Ok(())
        })?,
    )?;

    install_drawable_methods(lua, context, &module)?;
    context
        .borrow_mut()
        .method_tables
        .register(lua, TypeTag::Surface, module.clone())?;
    kq.set(TypeTag::Surface.field_name(), module)?;
    Ok(())
}

/// Builds a text surface from a property table, validating every entry
/// before anything is allocated.
fn text_surface_from_properties(
    context: &ContextRef,
    args: &Args,
) -> mlua::Result<TextSurface> {
    let mut text_surface = TextSurface::default();
    if args.len() == 0 {
        return Ok(text_surface);
    }
    let properties = args.check_table(1)?;
    for pair in properties.pairs::<Value, Value>() {
        let (key, value) = pair?;
        let key = match key {
            Value::String(key) => key.to_str()?.to_string(),
            other => {
                return Err(args
                    .invalid(1, format!("invalid key of type {}", other.type_name()))
                    .into())
            }
        };
        let property = Args::new("create", Variadic::from_iter([value]));
        match key.as_str() {
            "font" => text_surface.font = Some(property.check_string(1)?),
            "rendering_mode" => {
                text_surface.rendering_mode = property.check_enum(1, &RENDERING_MODES)?
            }
            "horizontal_alignment" => {
                text_surface.horizontal_alignment = property.check_enum(1, &HORIZONTAL_ALIGNMENTS)?
            }
            "vertical_alignment" => {
                text_surface.vertical_alignment = property.check_enum(1, &VERTICAL_ALIGNMENTS)?
            }
            "color" => text_surface.color = property.check_color(1)?,
            "text" => text_surface.text = property.check_string(1)?,
            "text_key" => {
                let text_key = property.check_string(1)?;
                text_surface.text = lookup_string(context, &text_key)?;
            }
            other => {
                return Err(args
                    .invalid(1, format!("Invalid key '{other}' for text surface properties"))
                    .into())
            }
        }
    }
    Ok(text_surface)
}

fn lookup_string(context: &ContextRef, key: &str) -> mlua::Result<String> {
    context
        .borrow()
        .strings
        .get(key)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::MissingString(key.to_string()).into())
}

pub(crate) fn install_text_surface_module(
    lua: &Lua,
    context: &ContextRef,
    kq: &Table,
) -> Result<()> {
    let module = lua.create_table()?;

    let create_context = context.clone();
    module.set(
        "create",
        lua.create_function(move |lua, values: Variadic<Value>| {
            let args = Args::new("create", values);
            let text_surface = text_surface_from_properties(&create_context, &args)?;
            push_new_drawable(lua, &create_context, Drawable::text(text_surface))
        })?,
    )?;

    let get_text_context = context.clone();
    module.set(
        "get_text",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("get_text", values);
            let id = args.check_object(1, TypeTag::TextSurface)?;
            let mut ctx = get_text_context.borrow_mut();
            Ok(text_surface_mut(&mut ctx, id)?.text().to_string())
        })?,
    )?;

    let set_text_context = context.clone();
    module.set(
        "set_text",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("set_text", values);
            let id = args.check_object(1, TypeTag::TextSurface)?;
            let text = args.opt_string(2)?.unwrap_or_default();
            let mut ctx = set_text_context.borrow_mut();
            text_surface_mut(&mut ctx, id)?.set_text(text);
            Ok(())
        })?,
    )?;

    let set_text_key_context = context.clone();
    module.set(
        "set_text_key",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("set_text_key", values);
            let id = args.check_object(1, TypeTag::TextSurface)?;
            let key = args.check_string(2)?;
            let text = lookup_string(&set_text_key_context, &key)?;
            let mut ctx = set_text_key_context.borrow_mut();
            text_surface_mut(&mut ctx, id)?.set_text(text);
            Ok(())
        })?,
    )?;

    let size_context = context.clone();
    module.set(
        "get_size",
        lua.create_function(move |_, values: Variadic<Value>| {
            let args = Args::new("get_size", values);
            let id = args.check_object(1, TypeTag::TextSurface)?;
            let mut guard = size_context.borrow_mut();
            let ctx = &mut *guard;
            let renderer = ctx.renderer.clone();
            let text = text_surface_mut(ctx, id)?;
            Ok(renderer.measure_text(text.font(), text.text()))
        })?,
    )?;

    install_drawable_methods(lua, context, &module)?;
    context
        .borrow_mut()
        .method_tables
        .register(lua, TypeTag::TextSurface, module.clone())?;
    kq.set(TypeTag::TextSurface.field_name(), module)?;
    Ok(())
}
