use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use crate::main_loop::DEFAULT_FRAME_MS;

#[derive(Parser, Debug)]
#[command(about = "Headless host that runs a quest's Lua scripts", version)]
pub struct Args {
    /// Quest data directory or .kq pack archive
    #[arg(long, default_value = "data")]
    pub data_root: PathBuf,

    /// Directory under which the quest's write directory lives (saving disabled when absent)
    #[arg(long)]
    pub write_root: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    pub frames: Option<u64>,

    /// Simulated duration of one frame in milliseconds
    #[arg(long, default_value_t = DEFAULT_FRAME_MS)]
    pub frame_ms: u64,

    /// Pace frames against the wall clock
    #[arg(long)]
    pub realtime: bool,

    /// JSON list of {frame, event} entries to feed as input
    #[arg(long)]
    pub input_script: Option<PathBuf>,

    /// Path to write the engine event trace as JSON
    #[arg(long)]
    pub event_log_json: Option<PathBuf>,

    /// Path to write the recorded draw calls as JSON
    #[arg(long)]
    pub render_log_json: Option<PathBuf>,

    /// Path to write the recorded audio events as JSON
    #[arg(long)]
    pub audio_log_json: Option<PathBuf>,

    /// Raise the default log level to debug
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug)]
pub struct RunArgs {
    pub data_root: PathBuf,
    pub write_root: Option<PathBuf>,
    pub frames: Option<u64>,
    pub frame_ms: u64,
    pub realtime: bool,
    pub input_script: Option<PathBuf>,
    pub event_log_json: Option<PathBuf>,
    pub render_log_json: Option<PathBuf>,
    pub audio_log_json: Option<PathBuf>,
    pub verbose: bool,
}

pub fn parse() -> Result<RunArgs> {
    Args::parse().into_run_args()
}

impl Args {
    fn into_run_args(self) -> Result<RunArgs> {
        if self.frame_ms == 0 {
            bail!("--frame-ms must be at least 1");
        }
        Ok(RunArgs {
            data_root: self.data_root,
            write_root: self.write_root,
            frames: self.frames,
            frame_ms: self.frame_ms,
            realtime: self.realtime,
            input_script: self.input_script,
            event_log_json: self.event_log_json,
            render_log_json: self.render_log_json,
            audio_log_json: self.audio_log_json,
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_validation() {
        let args = Args::try_parse_from(["kq_engine", "--frames", "10"]).unwrap();
        let run = args.into_run_args().unwrap();
        assert_eq!(run.data_root, PathBuf::from("data"));
        assert_eq!(run.frame_ms, DEFAULT_FRAME_MS);
        assert_eq!(run.frames, Some(10));

        let args = Args::try_parse_from(["kq_engine", "--frame-ms", "0"]).unwrap();
        assert!(args.into_run_args().is_err());
    }
}
