/// Channel levels written to the RGB status LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub fn is_lit(self) -> bool {
        self.r != 0 || self.g != 0 || self.b != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Off,
    Red,
    Green,
    Blue,
    Yellow,
}

impl Color {
    pub fn rgb(self, level: u8) -> Rgb {
        match self {
            Self::Off => Rgb::OFF,
            Self::Red => Rgb { r: level, g: 0, b: 0 },
            Self::Green => Rgb { r: 0, g: level, b: 0 },
            Self::Blue => Rgb { r: 0, g: 0, b: level },
            Self::Yellow => Rgb { r: level, g: level, b: 0 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorMode {
    Solid(Color),
    Blink(Color),
}

/// Physical LED output. Has no failure mode.
pub trait Indicator {
    fn set(&mut self, color: Rgb);
}

/// Turns a requested [`IndicatorMode`] into LED writes.
///
/// Blink phase lives here rather than being read back from the hardware:
/// a blink request toggles between the color and off once per interval,
/// whatever the polling rate, as long as polling is faster than the interval.
#[derive(Debug, Clone)]
pub struct StatusIndicator {
    blink_interval_ms: u64,
    intensity: u8,
    lit: bool,
    last_toggle_ms: Option<u64>,
    output: Option<Rgb>,
}

impl StatusIndicator {
    pub fn new(blink_interval_ms: u64) -> Self {
        Self::with_intensity(blink_interval_ms, u8::MAX)
    }

    pub fn with_intensity(blink_interval_ms: u64, intensity: u8) -> Self {
        Self {
            blink_interval_ms,
            intensity,
            lit: false,
            last_toggle_ms: None,
            output: None,
        }
    }

    pub fn is_lit(&self) -> bool {
        self.lit
    }

    pub fn output(&self) -> Rgb {
        self.output.unwrap_or(Rgb::OFF)
    }

    pub fn drive<I: Indicator>(&mut self, out: &mut I, mode: IndicatorMode, now_ms: u64) {
        match mode {
            IndicatorMode::Solid(color) => {
                let rgb = color.rgb(self.intensity);
                self.lit = rgb.is_lit();
                self.write(out, rgb);
            }
            IndicatorMode::Blink(color) => {
                let due = self
                    .last_toggle_ms
                    .map(|last| now_ms.saturating_sub(last) >= self.blink_interval_ms)
                    .unwrap_or(true);
                if !due {
                    return;
                }

                self.last_toggle_ms = Some(now_ms);
                if self.lit {
                    self.lit = false;
                    self.write(out, Rgb::OFF);
                } else {
                    let rgb = color.rgb(self.intensity);
                    self.lit = rgb.is_lit();
                    self.write(out, rgb);
                }
            }
        }
    }

    fn write<I: Indicator>(&mut self, out: &mut I, rgb: Rgb) {
        if self.output != Some(rgb) {
            self.output = Some(rgb);
            out.set(rgb);
        }
    }
}
