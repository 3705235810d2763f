use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use walkdir::WalkDir;

use crate::pack::{PackArchive, normalize_name};

#[derive(Debug)]
enum DataSource {
    Directory(PathBuf),
    Pack(PackArchive),
    Memory(BTreeMap<String, Vec<u8>>),
}

/// Quest data as seen by the engine: a read-only data root layered under an
/// optional writable directory.
#[derive(Debug)]
pub struct DataStore {
    source: DataSource,
    write_root: Option<PathBuf>,
    quest_write_dir: Option<String>,
    language: Option<String>,
}

impl DataStore {
    /// Opens a data directory or a `.kq` pack archive.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = if path.is_dir() {
            DataSource::Directory(path.to_path_buf())
        } else if path.is_file() {
            DataSource::Pack(PackArchive::open(path)?)
        } else {
            bail!("data root {} does not exist", path.display());
        };
        Ok(Self::with_source(source))
    }

    pub fn from_memory<I, N>(files: I) -> Self
    where
        I: IntoIterator<Item = (N, Vec<u8>)>,
        N: AsRef<str>,
    {
        let files = files
            .into_iter()
            .map(|(name, bytes)| (normalize_name(name.as_ref()), bytes))
            .collect();
        Self::with_source(DataSource::Memory(files))
    }

    fn with_source(source: DataSource) -> Self {
        Self {
            source,
            write_root: None,
            quest_write_dir: None,
            language: None,
        }
    }

    pub fn describe(&self) -> String {
        match &self.source {
            DataSource::Directory(path) => format!("directory {}", path.display()),
            DataSource::Pack(pack) => format!("pack {}", pack.path().display()),
            DataSource::Memory(files) => format!("memory ({} files)", files.len()),
        }
    }

    pub fn set_write_root<P: Into<PathBuf>>(&mut self, root: P) {
        self.write_root = Some(root.into());
    }

    pub fn set_quest_write_dir(&mut self, dir: Option<String>) {
        self.quest_write_dir = dir.filter(|dir| !dir.is_empty());
    }

    pub fn quest_write_dir(&self) -> Option<&str> {
        self.quest_write_dir.as_deref()
    }

    /// Directory where saved files of this quest go, if the quest declared one.
    pub fn write_dir(&self) -> Option<PathBuf> {
        match (&self.write_root, &self.quest_write_dir) {
            (Some(root), Some(dir)) => Some(root.join(dir)),
            _ => None,
        }
    }

    pub fn set_language(&mut self, code: Option<String>) {
        self.language = code;
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Maps a quest file name to its path inside the data root, prefixing the
    /// current language directory when asked to.
    pub fn resolve_name(&self, name: &str, language_specific: bool) -> Result<String> {
        let name = normalize_name(name);
        if !language_specific {
            return Ok(name);
        }
        let language = self
            .language
            .as_deref()
            .ok_or_else(|| anyhow!("cannot open language-specific file {name}: no language set"))?;
        Ok(format!("languages/{language}/{name}"))
    }

    pub fn exists(&self, name: &str) -> bool {
        let name = normalize_name(name);
        if leaves_root(&name) {
            return false;
        }
        if self.written_path(&name).is_some_and(|path| path.is_file()) {
            return true;
        }
        match &self.source {
            DataSource::Directory(root) => root.join(&name).is_file(),
            DataSource::Pack(pack) => pack.find_entry(&name).is_some(),
            DataSource::Memory(files) => files.contains_key(&name),
        }
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.read_optional(name)?
            .ok_or_else(|| anyhow!("cannot find quest file {name} in {}", self.describe()))
    }

    pub fn read_optional(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let name = normalize_name(name);
        if leaves_root(&name) {
            return Ok(None);
        }
        if let Some(path) = self.written_path(&name).filter(|path| path.is_file()) {
            let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            return Ok(Some(bytes));
        }
        match &self.source {
            DataSource::Directory(root) => {
                let path = root.join(&name);
                if !path.is_file() {
                    return Ok(None);
                }
                let bytes =
                    fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                Ok(Some(bytes))
            }
            DataSource::Pack(pack) => Ok(pack
                .find_entry(&name)
                .map(|entry| pack.read_entry_bytes(entry).to_vec())),
            DataSource::Memory(files) => Ok(files.get(&name).cloned()),
        }
    }

    /// Lists data-root files whose name starts with `prefix`.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize_name(prefix);
        let mut names: Vec<String> = match &self.source {
            DataSource::Directory(root) => WalkDir::new(root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| {
                    let relative = entry.path().strip_prefix(root).ok()?;
                    Some(normalize_name(&relative.to_string_lossy()))
                })
                .filter(|name| name.starts_with(&prefix))
                .collect(),
            DataSource::Pack(pack) => pack
                .entries()
                .iter()
                .filter(|entry| entry.name.starts_with(&prefix))
                .map(|entry| entry.name.clone())
                .collect(),
            DataSource::Memory(files) => files
                .keys()
                .filter(|name| name.starts_with(&prefix))
                .cloned()
                .collect(),
        };
        names.sort();
        names
    }

    /// Writes a file into the quest write directory.
    pub fn save(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let name = normalize_name(name);
        if leaves_root(&name) {
            bail!("cannot save {name}: the name leaves the write directory");
        }
        let path = self
            .written_path(&name)
            .ok_or_else(|| anyhow!("cannot save {name}: no write directory"))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating write directory {}", parent.display()))?;
        }
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let name = normalize_name(name);
        if leaves_root(&name) {
            bail!("cannot delete {name}: the name leaves the write directory");
        }
        let path = self
            .written_path(&name)
            .ok_or_else(|| anyhow!("cannot delete {name}: no write directory"))?;
        if path.is_file() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }

    fn written_path(&self, name: &str) -> Option<PathBuf> {
        if leaves_root(name) {
            return None;
        }
        self.write_dir().map(|dir| dir.join(name))
    }
}

/// Whether a normalized name climbs out of the directory it is joined to.
fn leaves_root(name: &str) -> bool {
    name.split('/').any(|part| part == "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackWriter;
    use tempfile::tempdir;

    #[test]
    fn write_dir_shadows_data_root() {
        let data = tempdir().unwrap();
        let home = tempdir().unwrap();
        fs::write(data.path().join("settings.dat"), "language = \"en\"").unwrap();

        let mut store = DataStore::open(data.path()).unwrap();
        assert!(store.write_dir().is_none());
        assert!(store.save("settings.dat", b"x").is_err());

        store.set_write_root(home.path());
        store.set_quest_write_dir(Some("kq_demo".into()));
        assert_eq!(store.read("settings.dat").unwrap(), b"language = \"en\"");

        let saved = store.save("settings.dat", b"language = \"fr\"").unwrap();
        assert_eq!(saved, home.path().join("kq_demo").join("settings.dat"));
        assert_eq!(store.read("settings.dat").unwrap(), b"language = \"fr\"");

        store.delete("settings.dat").unwrap();
        assert_eq!(store.read("settings.dat").unwrap(), b"language = \"en\"");
    }

    #[test]
    fn names_cannot_climb_out_of_the_write_dir() {
        let data = tempdir().unwrap();
        let home = tempdir().unwrap();
        fs::write(home.path().join("outside.dat"), "secret").unwrap();

        let mut store = DataStore::open(data.path()).unwrap();
        store.set_write_root(home.path());
        store.set_quest_write_dir(Some("kq_demo".into()));

        let err = store.save("../escape.dat", b"x").unwrap_err();
        assert!(err.to_string().contains("leaves the write directory"));
        assert!(store.save("saves/../../escape.dat", b"x").is_err());
        assert!(!home.path().join("escape.dat").exists());
        assert!(store.delete("../outside.dat").is_err());
        assert!(home.path().join("outside.dat").is_file());

        assert!(!store.exists("../outside.dat"));
        assert!(store.read_optional("../outside.dat").unwrap().is_none());
        assert!(store.save("saves/slot..1.dat", b"ok").is_ok());
    }

    #[test]
    fn reads_from_pack_and_lists_prefix() {
        let dir = tempdir().unwrap();
        let pack_path = dir.path().join("data.kq");
        let mut writer = PackWriter::new();
        writer.add("main.lua", b"-- main".to_vec()).unwrap();
        writer.add("sounds/timer.ogg", Vec::new()).unwrap();
        writer.add("sounds/danger.ogg", Vec::new()).unwrap();
        writer.write_to(&pack_path).unwrap();

        let store = DataStore::open(&pack_path).unwrap();
        assert!(store.exists("main.lua"));
        assert!(!store.exists("missing.lua"));
        assert_eq!(
            store.list("sounds/"),
            ["sounds/danger.ogg", "sounds/timer.ogg"]
        );
        assert!(store.read_optional("nope").unwrap().is_none());
    }

    #[test]
    fn language_specific_names_need_a_language() {
        let mut store = DataStore::from_memory([("languages/en/text/strings.dat", Vec::new())]);
        assert!(store.resolve_name("text/strings.dat", true).is_err());
        store.set_language(Some("en".into()));
        let name = store.resolve_name("text/strings.dat", true).unwrap();
        assert_eq!(name, "languages/en/text/strings.dat");
        assert!(store.exists(&name));
    }
}
