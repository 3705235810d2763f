use mlua::{AnyUserData, Function, Result as LuaResult, Table, Value, Variadic};

use super::errors::BridgeError;
use super::handles::ObjectHandle;
use super::scriptable::{ObjectId, TypeTag};
use super::ContextId;
use crate::backend::Color;

/// Positional arguments of a Lua call, checked the way the API reports
/// misuse: `bad argument #N to 'name' (X expected, got Y)`.
pub(crate) struct Args<'lua> {
    function: &'static str,
    values: Vec<Value<'lua>>,
}

impl<'lua> Args<'lua> {
    pub(crate) fn new(function: &'static str, values: Variadic<Value<'lua>>) -> Self {
        Self {
            function,
            values: values.into_iter().collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    /// 1-based access; missing arguments read as nil.
    pub(crate) fn get(&self, index: usize) -> Value<'lua> {
        index
            .checked_sub(1)
            .and_then(|slot| self.values.get(slot))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    pub(crate) fn is_none_or_nil(&self, index: usize) -> bool {
        matches!(self.get(index), Value::Nil)
    }

    pub(crate) fn is_number(&self, index: usize) -> bool {
        matches!(self.get(index), Value::Integer(_) | Value::Number(_))
    }

    pub(crate) fn bad_type(&self, index: usize, expected: &'static str) -> BridgeError {
        BridgeError::BadArgument {
            index,
            function: self.function,
            expected,
            got: if index > self.values.len() {
                "no value".to_string()
            } else {
                describe_type(&self.get(index))
            },
        }
    }

    pub(crate) fn invalid(&self, index: usize, message: impl Into<String>) -> BridgeError {
        BridgeError::InvalidArgument {
            index,
            function: self.function,
            message: message.into(),
        }
    }

    pub(crate) fn check_table(&self, index: usize) -> LuaResult<Table<'lua>> {
        match self.get(index) {
            Value::Table(table) => Ok(table),
            _ => Err(self.bad_type(index, "table").into()),
        }
    }

    pub(crate) fn check_function(&self, index: usize) -> LuaResult<Function<'lua>> {
        match self.get(index) {
            Value::Function(function) => Ok(function),
            _ => Err(self.bad_type(index, "function").into()),
        }
    }

    pub(crate) fn check_integer(&self, index: usize) -> LuaResult<i64> {
        value_to_i64(&self.get(index)).ok_or_else(|| self.bad_type(index, "number").into())
    }

    /// A width or height: an integer that fits in `u32`.
    pub(crate) fn check_size(&self, index: usize) -> LuaResult<u32> {
        let value = self.check_integer(index)?;
        u32::try_from(value)
            .map_err(|_| self.invalid(index, format!("size {value} out of range")).into())
    }

    /// A pixel coordinate that fits in `i32`.
    pub(crate) fn check_position(&self, index: usize) -> LuaResult<i32> {
        let value = self.check_integer(index)?;
        i32::try_from(value)
            .map_err(|_| self.invalid(index, format!("position {value} out of range")).into())
    }

    pub(crate) fn opt_integer(&self, index: usize, default: i64) -> LuaResult<i64> {
        if self.is_none_or_nil(index) {
            return Ok(default);
        }
        self.check_integer(index)
    }

    pub(crate) fn check_string(&self, index: usize) -> LuaResult<String> {
        match self.get(index) {
            Value::String(text) => Ok(text.to_str()?.to_string()),
            Value::Integer(value) => Ok(value.to_string()),
            Value::Number(value) => Ok(value.to_string()),
            _ => Err(self.bad_type(index, "string").into()),
        }
    }

    pub(crate) fn opt_string(&self, index: usize) -> LuaResult<Option<String>> {
        if self.is_none_or_nil(index) {
            return Ok(None);
        }
        self.check_string(index).map(Some)
    }

    /// Lua truthiness, with a default for absent arguments.
    pub(crate) fn opt_bool(&self, index: usize, default: bool) -> bool {
        match self.get(index) {
            Value::Nil if index > self.len() => default,
            Value::Nil | Value::Boolean(false) => false,
            _ => true,
        }
    }

    pub(crate) fn check_object(&self, index: usize, tag: TypeTag) -> LuaResult<ObjectId> {
        match handle_of(&self.get(index)) {
            Some((id, found)) if found == tag => Ok(id),
            _ => Err(self.bad_type(index, tag.module_name()).into()),
        }
    }

    pub(crate) fn check_drawable(&self, index: usize) -> LuaResult<ObjectId> {
        match handle_of(&self.get(index)) {
            Some((id, tag)) if tag.is_drawable() => Ok(id),
            _ => Err(self.bad_type(index, "drawable").into()),
        }
    }

    /// An owning context: any table, or any engine object.
    pub(crate) fn check_context(&self, index: usize) -> LuaResult<ContextId> {
        let value = self.get(index);
        match &value {
            Value::Table(table) => Ok(ContextId::of_table(table)),
            Value::UserData(_) => match handle_of(&value) {
                Some((id, _)) => Ok(ContextId::Object(id)),
                None => Err(self.bad_type(index, "table or userdata").into()),
            },
            _ => Err(self.bad_type(index, "table or userdata").into()),
        }
    }

    pub(crate) fn check_color(&self, index: usize) -> LuaResult<Color> {
        let table = self.check_table(index)?;
        let component = |slot: i64| -> LuaResult<Option<u8>> {
            match table.raw_get::<_, Value>(slot)? {
                Value::Nil => Ok(None),
                value => match value_to_i64(&value) {
                    Some(number) => Ok(Some(number.clamp(0, 255) as u8)),
                    None => Err(self.invalid(index, "color components must be numbers").into()),
                },
            }
        };
        let (Some(r), Some(g), Some(b)) = (component(1)?, component(2)?, component(3)?) else {
            return Err(self
                .invalid(index, "color must be a table of 3 or 4 numbers")
                .into());
        };
        let a = component(4)?.unwrap_or(255);
        Ok(Color { r, g, b, a })
    }

    /// Matches a string argument against a fixed list of names.
    pub(crate) fn check_enum<T: Copy>(&self, index: usize, names: &[(&str, T)]) -> LuaResult<T> {
        let name = self.check_string(index)?;
        names
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, value)| *value)
            .ok_or_else(|| {
                let allowed: Vec<_> = names.iter().map(|(candidate, _)| *candidate).collect();
                self.invalid(
                    index,
                    format!("invalid name '{name}', expected one of {}", allowed.join(", ")),
                )
                .into()
            })
    }
}

pub(crate) fn handle_of(value: &Value) -> Option<(ObjectId, TypeTag)> {
    match value {
        Value::UserData(userdata) => handle_parts(userdata),
        _ => None,
    }
}

fn handle_parts(userdata: &AnyUserData) -> Option<(ObjectId, TypeTag)> {
    userdata
        .borrow::<ObjectHandle>()
        .ok()
        .map(|handle| (handle.id(), handle.tag()))
}

pub(crate) fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(number) => Some(*number),
        Value::Number(number) if number.is_finite() => Some(number.trunc() as i64),
        Value::String(text) => text.to_str().ok()?.trim().parse::<f64>().ok().map(|n| n as i64),
        _ => None,
    }
}

pub(crate) fn describe_type(value: &Value) -> String {
    match handle_of(value) {
        Some((_, tag)) => tag.module_name().to_string(),
        None => value.type_name().to_string(),
    }
}
