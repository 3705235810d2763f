use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    In,
    Out,
}

/// Time-driven effect attached to a drawable.
pub(crate) trait Transition: fmt::Debug {
    fn name(&self) -> &'static str;
    fn start(&mut self, now: u64);
    fn update(&mut self, now: u64);
    fn is_finished(&self) -> bool;

    /// Opacity the effect currently imposes, 0 to 256.
    fn alpha(&self) -> Option<u16> {
        None
    }
}

pub(crate) const DEFAULT_FADE_DELAY: u64 = 20;

const FADE_STEP: i32 = 8;
const ALPHA_OPAQUE: i32 = 256;

/// Fades a drawable in or out one alpha step every `delay` milliseconds.
#[derive(Debug, Clone)]
pub(crate) struct TransitionFade {
    direction: Direction,
    delay: u64,
    alpha: Option<i32>,
    next_frame_date: u64,
    finished: bool,
}

impl TransitionFade {
    pub(crate) fn new(direction: Direction, delay: u64) -> Self {
        Self {
            direction,
            delay: delay.max(1),
            alpha: None,
            next_frame_date: 0,
            finished: false,
        }
    }

    fn alpha_start(&self) -> i32 {
        match self.direction {
            Direction::In => 0,
            Direction::Out => ALPHA_OPAQUE,
        }
    }

    fn alpha_limit(&self) -> i32 {
        match self.direction {
            Direction::In => ALPHA_OPAQUE,
            Direction::Out => 0,
        }
    }

    fn alpha_increment(&self) -> i32 {
        match self.direction {
            Direction::In => FADE_STEP,
            Direction::Out => -FADE_STEP,
        }
    }
}

impl Transition for TransitionFade {
    fn name(&self) -> &'static str {
        match self.direction {
            Direction::In => "fade_in",
            Direction::Out => "fade_out",
        }
    }

    fn start(&mut self, now: u64) {
        self.alpha = Some(self.alpha_start());
        self.next_frame_date = now;
        self.finished = false;
    }

    fn update(&mut self, now: u64) {
        let Some(mut alpha) = self.alpha.filter(|_| !self.finished) else {
            return;
        };
        while now >= self.next_frame_date && !self.finished {
            alpha += self.alpha_increment();
            self.next_frame_date += self.delay;
            self.finished = alpha == self.alpha_limit();
        }
        self.alpha = Some(alpha);
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn alpha(&self) -> Option<u16> {
        self.alpha.map(|alpha| alpha.clamp(0, ALPHA_OPAQUE) as u16)
    }
}
