use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Cursor;
use std::rc::Rc;

use anyhow::{Context, Result};
use serde::Serialize;

/// Native identity of a surface as seen by a renderer.
pub type SurfaceKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color {
        r: 0,
        g: 0,
        b: 0,
        a: 255,
    };
    pub const WHITE: Color = Color {
        r: 255,
        g: 255,
        b: 255,
        a: 255,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextDraw {
    pub text: String,
    pub font: Option<String>,
    pub color: Color,
    pub antialiased: bool,
    pub x: i32,
    pub y: i32,
    pub opacity: u8,
}

/// Pixel work the script bridge delegates to the video layer.
pub trait RenderBackend {
    fn screen_size(&self) -> (u32, u32);
    /// Decodes enough of an image to know its dimensions.
    fn load_image(&self, name: &str, bytes: &[u8]) -> Result<(u32, u32)>;
    fn measure_text(&self, font: Option<&str>, text: &str) -> (u32, u32);
    fn fill(&self, target: SurfaceKey, color: Color, area: Option<Rect>);
    fn blit(&self, source: SurfaceKey, target: SurfaceKey, x: i32, y: i32, opacity: u8);
    fn draw_text(&self, target: SurfaceKey, text: &TextDraw);
    fn present(&self, root: SurfaceKey);
    fn video_mode(&self) -> String;
    fn set_video_mode(&self, mode: &str) -> bool;
}

/// Sound playback the script bridge delegates to the audio layer.
pub trait AudioBackend {
    fn sound_exists(&self, id: &str) -> bool;
    fn play_sound(&self, id: &str);
    fn preload_sounds(&self);
    fn volume(&self) -> i32;
    fn set_volume(&self, volume: i32);
    fn music_volume(&self) -> i32;
    fn set_music_volume(&self, volume: i32);
}

impl fmt::Debug for dyn RenderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RenderBackend")
    }
}

impl fmt::Debug for dyn AudioBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AudioBackend")
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderEvent {
    Fill {
        target: SurfaceKey,
        color: Color,
        area: Option<Rect>,
    },
    Blit {
        source: SurfaceKey,
        target: SurfaceKey,
        x: i32,
        y: i32,
        opacity: u8,
    },
    Text {
        target: SurfaceKey,
        draw: TextDraw,
    },
    Present {
        root: SurfaceKey,
    },
    VideoMode {
        mode: String,
    },
}

const VIDEO_MODES: &[&str] = &["windowed", "fullscreen"];
const GLYPH_WIDTH: u32 = 8;
const GLYPH_HEIGHT: u32 = 16;

/// Headless renderer that only records what would have been drawn.
#[derive(Clone)]
pub struct RecordingRenderer {
    screen: (u32, u32),
    video_mode: Rc<RefCell<String>>,
    events: Rc<RefCell<Vec<RenderEvent>>>,
}

impl RecordingRenderer {
    pub fn new(screen: (u32, u32)) -> Self {
        Self {
            screen,
            video_mode: Rc::new(RefCell::new(VIDEO_MODES[0].to_string())),
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<RenderEvent> {
        self.events.borrow().clone()
    }

    fn record(&self, event: RenderEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl RenderBackend for RecordingRenderer {
    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }

    fn load_image(&self, name: &str, bytes: &[u8]) -> Result<(u32, u32)> {
        image::io::Reader::new(Cursor::new(bytes))
            .with_guessed_format()
            .with_context(|| format!("guessing image format of {name}"))?
            .into_dimensions()
            .with_context(|| format!("reading dimensions of {name}"))
    }

    fn measure_text(&self, _font: Option<&str>, text: &str) -> (u32, u32) {
        if text.is_empty() {
            return (0, 0);
        }
        (text.chars().count() as u32 * GLYPH_WIDTH, GLYPH_HEIGHT)
    }

    fn fill(&self, target: SurfaceKey, color: Color, area: Option<Rect>) {
        self.record(RenderEvent::Fill {
            target,
            color,
            area,
        });
    }

    fn blit(&self, source: SurfaceKey, target: SurfaceKey, x: i32, y: i32, opacity: u8) {
        self.record(RenderEvent::Blit {
            source,
            target,
            x,
            y,
            opacity,
        });
    }

    fn draw_text(&self, target: SurfaceKey, text: &TextDraw) {
        self.record(RenderEvent::Text {
            target,
            draw: text.clone(),
        });
    }

    fn present(&self, root: SurfaceKey) {
        self.record(RenderEvent::Present { root });
    }

    fn video_mode(&self) -> String {
        self.video_mode.borrow().clone()
    }

    fn set_video_mode(&self, mode: &str) -> bool {
        if !VIDEO_MODES.contains(&mode) {
            return false;
        }
        *self.video_mode.borrow_mut() = mode.to_string();
        self.record(RenderEvent::VideoMode {
            mode: mode.to_string(),
        });
        true
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioEvent {
    SoundPlay { id: String },
    Preload { count: usize },
    Volume { volume: i32 },
    MusicVolume { volume: i32 },
}

/// Headless audio layer: knows which sounds exist and records playback.
#[derive(Clone)]
pub struct RecordingAudio {
    known: Rc<BTreeSet<String>>,
    volume: Rc<Cell<i32>>,
    music_volume: Rc<Cell<i32>>,
    events: Rc<RefCell<Vec<AudioEvent>>>,
}

impl RecordingAudio {
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: Rc::new(known.into_iter().map(Into::into).collect()),
            volume: Rc::new(Cell::new(100)),
            music_volume: Rc::new(Cell::new(100)),
            events: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<AudioEvent> {
        self.events.borrow().clone()
    }

    pub fn played(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                AudioEvent::SoundPlay { id } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

impl AudioBackend for RecordingAudio {
    fn sound_exists(&self, id: &str) -> bool {
        self.known.contains(id)
    }

    fn play_sound(&self, id: &str) {
        self.events
            .borrow_mut()
            .push(AudioEvent::SoundPlay { id: id.to_string() });
    }

    fn preload_sounds(&self) {
        self.events.borrow_mut().push(AudioEvent::Preload {
            count: self.known.len(),
        });
    }

    fn volume(&self) -> i32 {
        self.volume.get()
    }

    fn set_volume(&self, volume: i32) {
        let volume = volume.clamp(0, 100);
        self.volume.set(volume);
        self.events.borrow_mut().push(AudioEvent::Volume { volume });
    }

    fn music_volume(&self) -> i32 {
        self.music_volume.get()
    }

    fn set_music_volume(&self, volume: i32) {
        let volume = volume.clamp(0, 100);
        self.music_volume.set(volume);
        self.events
            .borrow_mut()
            .push(AudioEvent::MusicVolume { volume });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_audio_tracks_known_sounds_and_volume() {
        let audio = RecordingAudio::new(["timer", "danger"]);
        assert!(audio.sound_exists("timer"));
        assert!(!audio.sound_exists("timer_hurry"));
        audio.play_sound("timer");
        audio.set_volume(140);
        assert_eq!(audio.volume(), 100);
        audio.preload_sounds();
        assert_eq!(
            audio.events(),
            vec![
                AudioEvent::SoundPlay { id: "timer".into() },
                AudioEvent::Volume { volume: 100 },
                AudioEvent::Preload { count: 2 },
            ]
        );
        assert_eq!(audio.played(), vec!["timer".to_string()]);
    }

    #[test]
    fn recording_renderer_serializes_events() {
        let renderer = RecordingRenderer::new((320, 240));
        renderer.fill(1, Color::BLACK, None);
        renderer.blit(2, 1, 10, 20, 128);
        assert!(!renderer.set_video_mode("stretched"));
        assert!(renderer.set_video_mode("fullscreen"));
        assert_eq!(renderer.video_mode(), "fullscreen");
        assert_eq!(renderer.measure_text(None, "Quit"), (32, 16));

        let json = serde_json::to_value(renderer.events()).unwrap();
        assert_eq!(json[0]["kind"], "fill");
        assert_eq!(json[1]["opacity"], 128);
        assert_eq!(json[2]["mode"], "fullscreen");
    }

    #[test]
    fn load_image_reads_png_dimensions() {
        use image::{codecs::png::PngEncoder, ColorType, ImageEncoder};

        let mut bytes = Vec::new();
        PngEncoder::new(&mut bytes)
            .write_image(&[0u8; 3 * 4 * 2], 3, 2, ColorType::Rgba8)
            .unwrap();
        let renderer = RecordingRenderer::new((320, 240));
        assert_eq!(renderer.load_image("logo.png", &bytes).unwrap(), (3, 2));
        assert!(renderer.load_image("broken.png", b"nope").is_err());
    }
}
