use mlua::Error as LuaError;
use thiserror::Error;

use super::callbacks::RefId;
use super::scriptable::ObjectId;

/// Protocol errors raised back into the calling script.
#[derive(Debug, Error)]
pub(crate) enum BridgeError {
    #[error("bad argument #{index} to '{function}' ({expected} expected, got {got})")]
    BadArgument {
        index: usize,
        function: &'static str,
        expected: &'static str,
        got: String,
    },
    #[error("bad argument #{index} to '{function}' ({message})")]
    InvalidArgument {
        index: usize,
        function: &'static str,
        message: String,
    },
    #[error("invalid reference {0}: already consumed or cancelled")]
    InvalidRef(RefId),
    #[error("object {0} no longer exists")]
    StaleObject(ObjectId),
    #[error("Cannot find sound '{0}'")]
    MissingSound(String),
    #[error("Cannot find script file '{0}'")]
    MissingScript(String),
    #[error("No value with key '{0}' in strings.dat")]
    MissingString(String),
    #[error("a menu cannot be started under itself or one of its own menus")]
    MenuCycle,
    #[error("Cannot save settings: no write directory was specified in quest.dat")]
    NoWriteDir,
}

impl From<BridgeError> for LuaError {
    fn from(err: BridgeError) -> Self {
        LuaError::RuntimeError(err.to_string())
    }
}
