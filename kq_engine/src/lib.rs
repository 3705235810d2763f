pub mod backend;
pub mod cli;
pub mod input;
pub mod lua_host;
pub mod main_loop;
pub mod quest;
pub mod runtime;
pub mod settings;
