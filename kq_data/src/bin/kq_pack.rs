use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kq_data::{PackArchive, PackWriter};
use serde::Serialize;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(about = "Inspect, extract and build KQ pack archives", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the entries of a pack archive
    List {
        /// Pack archive to inspect
        pack: PathBuf,

        /// Emit the listing as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Extract every entry of a pack archive into a directory
    Extract {
        /// Pack archive to extract
        pack: PathBuf,

        /// Destination directory
        #[arg(long, value_name = "DIR", default_value = "extracted")]
        dest: PathBuf,

        /// Overwrite existing files instead of skipping them
        #[arg(long)]
        overwrite: bool,
    },
    /// Pack a quest data directory into a single archive
    Build {
        /// Quest data directory (the one holding quest.dat)
        root: PathBuf,

        /// Output archive path
        #[arg(long, value_name = "PATH", default_value = "data.kq")]
        output: PathBuf,
    },
}

#[derive(Serialize)]
struct ListedEntry<'a> {
    name: &'a str,
    offset: u64,
    size: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::List { pack, json } => list(&pack, json),
        Command::Extract {
            pack,
            dest,
            overwrite,
        } => extract(&pack, &dest, overwrite),
        Command::Build { root, output } => build(&root, &output),
    }
}

fn list(path: &Path, json: bool) -> Result<()> {
    let archive = PackArchive::open(path)?;
    if json {
        let entries: Vec<_> = archive
            .entries()
            .iter()
            .map(|entry| ListedEntry {
                name: &entry.name,
                offset: entry.offset,
                size: entry.size,
            })
            .collect();
        let text = serde_json::to_string_pretty(&entries).context("serializing pack listing")?;
        println!("{text}");
        return Ok(());
    }

    println!("{} ({} entries)", path.display(), archive.entries().len());
    for entry in archive.entries() {
        println!("{:>10} {:>10}  {}", entry.offset, entry.size, entry.name);
    }
    Ok(())
}

fn extract(path: &Path, dest: &Path, overwrite: bool) -> Result<()> {
    let archive = PackArchive::open(path)?;
    fs::create_dir_all(dest).with_context(|| format!("creating destination {}", dest.display()))?;

    let mut written = 0usize;
    let mut skipped = 0usize;
    for entry in archive.entries() {
        let target = dest.join(sanitize_entry_path(&entry.name)?);
        if target.exists() && !overwrite {
            skipped += 1;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        archive.extract_entry(entry, &target)?;
        written += 1;
    }

    println!(
        "Extracted {written} entries into {} ({skipped} skipped)",
        dest.display()
    );
    Ok(())
}

fn build(root: &Path, output: &Path) -> Result<()> {
    if !root.join("quest.dat").is_file() {
        bail!("{} does not look like a quest: no quest.dat", root.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|res| res.ok()) {
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut writer = PackWriter::new();
    for file in files {
        let relative = file
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", file.display(), root.display()))?;
        let bytes = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
        writer.add(&relative.to_string_lossy(), bytes)?;
    }
    writer.write_to(output)?;
    println!("Packed {} files into {}", writer.len(), output.display());
    Ok(())
}

fn sanitize_entry_path(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => bail!("refusing to extract suspicious entry name {name}"),
        }
    }
    if clean.as_os_str().is_empty() {
        bail!("entry name {name} is empty after sanitizing");
    }
    Ok(clean)
}
