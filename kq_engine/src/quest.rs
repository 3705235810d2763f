use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use kq_data::DataStore;
use mlua::{Lua, Table};
use serde::Serialize;

pub const QUEST_FILE: &str = "quest.dat";

/// General properties a quest declares in `quest.dat` with a single
/// `quest{ ... }` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuestProperties {
    pub write_dir: Option<String>,
    pub title_bar: Option<String>,
}

impl QuestProperties {
    pub fn load(store: &DataStore) -> Result<Self> {
        let bytes = store
            .read(QUEST_FILE)
            .with_context(|| format!("a quest needs a {QUEST_FILE} file"))?;
        let text = String::from_utf8(bytes)
            .with_context(|| format!("{QUEST_FILE} is not valid UTF-8"))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let lua = Lua::new();
        let declared: Rc<RefCell<Option<QuestProperties>>> = Rc::new(RefCell::new(None));
        let env = lua.create_table()?;
        let sink = declared.clone();
        env.set(
            "quest",
            lua.create_function(move |_, properties: Table| {
                let write_dir: Option<String> = properties.get("write_dir")?;
                let title_bar: Option<String> = properties.get("title_bar")?;
                *sink.borrow_mut() = Some(QuestProperties {
                    write_dir,
                    title_bar,
                });
                Ok(())
            })?,
        )?;
        lua.load(text)
            .set_name(QUEST_FILE)
            .set_environment(env)
            .exec()
            .with_context(|| format!("reading {QUEST_FILE}"))?;
        let properties = declared.take();
        properties.ok_or_else(|| anyhow!("{QUEST_FILE} never calls quest{{ ... }}"))
    }
}
