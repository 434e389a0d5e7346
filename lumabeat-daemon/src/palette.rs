use anyhow::{Context, Result};
use image::{imageops, DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Working size the artwork is resampled to before tiling.
const SAMPLE_SIZE: u32 = 96;
/// Tiles per axis over the resampled image.
const TILE_GRID: u32 = 12;
/// Upper bound on retained extraction candidates.
const MAX_CANDIDATES: usize = 16;
/// Minimum hue separation (degrees) between retained candidates.
const HUE_SEPARATION: f32 = 30.0;
/// Contrast boost applied before sampling.
const CONTRAST_BOOST: f32 = 18.0;
/// Saturation multiplier applied before sampling.
const SATURATION_BOOST: f32 = 1.35;
/// Tiles darker/lighter than these lightness bounds are discarded.
const LIGHTNESS_MIN: f32 = 0.08;
const LIGHTNESS_MAX: f32 = 0.92;

/// Substituted wherever metadata carries a malformed color component.
pub const DIM_GRAY: Color = Color { r: 64, g: 64, b: 64 };

/// Cycled by slot index when an image yields nothing extractable.
const FALLBACK_CYCLE: [Color; 4] = [
    Color { r: 255, g: 0, b: 0 },
    Color { r: 0, g: 255, b: 0 },
    Color { r: 0, g: 0, b: 255 },
    Color { r: 255, g: 255, b: 0 },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse three textual components into a color. Any malformed or
    /// out-of-range component invalidates the whole triple and yields
    /// [`DIM_GRAY`] so nothing non-numeric ever reaches the lights.
    pub fn parse_rgb(r: &str, g: &str, b: &str) -> Self {
        fn component(s: &str) -> Option<u8> {
            let v = s.trim().parse::<f32>().ok()?;
            if !v.is_finite() || v < 0.0 {
                return None;
            }
            Some(v.min(255.0).round() as u8)
        }
        match (component(r), component(g), component(b)) {
            (Some(r), Some(g), Some(b)) => Self { r, g, b },
            _ => DIM_GRAY,
        }
    }

    pub fn distance(&self, other: &Color) -> f32 {
        let dr = self.r as f32 - other.r as f32;
        let dg = self.g as f32 - other.g as f32;
        let db = self.b as f32 - other.b as f32;
        (dr * dr + dg * dg + db * db).sqrt()
    }

    /// Average channel brightness in [0, 255].
    pub fn brightness(&self) -> f32 {
        (self.r as f32 + self.g as f32 + self.b as f32) / 3.0
    }

    /// Saturation as (max - min) / max, zero for black.
    pub fn saturation(&self) -> f32 {
        let max = self.r.max(self.g).max(self.b) as f32;
        let min = self.r.min(self.g).min(self.b) as f32;
        if max == 0.0 {
            0.0
        } else {
            (max - min) / max
        }
    }

    pub fn hue(&self) -> f32 {
        rgb_to_hsl(self.r, self.g, self.b).0
    }

    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    fn rotate_channels(&self) -> Color {
        Color::new(self.g, self.b, self.r)
    }

    fn invert(&self) -> Color {
        Color::new(255 - self.r, 255 - self.g, 255 - self.b)
    }

    fn threshold(&self) -> Color {
        fn t(c: u8) -> u8 {
            if c >= 128 {
                255
            } else {
                0
            }
        }
        Color::new(t(self.r), t(self.g), t(self.b))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PaletteConfig {
    /// Number of colors per palette.
    #[serde(default = "default_palette_size")]
    pub size: usize,
    /// Minimum pairwise euclidean RGB distance within a palette.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Minimum average channel brightness after correction.
    #[serde(default = "default_min_brightness")]
    pub min_brightness: f32,
    /// Minimum (max-min)/max saturation after correction.
    #[serde(default = "default_min_saturation")]
    pub min_saturation: f32,
}

fn default_palette_size() -> usize {
    3
}
fn default_similarity_threshold() -> f32 {
    75.0
}
fn default_min_brightness() -> f32 {
    60.0
}
fn default_min_saturation() -> f32 {
    0.25
}

impl Default for PaletteConfig {
    fn default() -> Self {
        Self {
            size: default_palette_size(),
            similarity_threshold: default_similarity_threshold(),
            min_brightness: default_min_brightness(),
            min_saturation: default_min_saturation(),
        }
    }
}

pub struct PaletteExtractor {
    cfg: PaletteConfig,
}

impl PaletteExtractor {
    pub fn new(cfg: PaletteConfig) -> Self {
        Self { cfg }
    }

    pub fn extract_from_file(&self, path: &Path) -> Result<Vec<Color>> {
        let img = image::open(path)
            .with_context(|| format!("failed to decode artwork {}", path.display()))?;
        Ok(self.extract(&img))
    }

    /// Produce exactly N diverse, corrected colors, ordered by descending
    /// saturation at selection time.
    pub fn extract(&self, img: &DynamicImage) -> Vec<Color> {
        let candidates = self.candidates(img);
        let mut palette: Vec<Color> = self
            .diversify(candidates)
            .into_iter()
            .map(|c| self.correct(c))
            .collect();
        palette.sort_by(|a, b| b.saturation().total_cmp(&a.saturation()));
        palette
    }

    /// Palette used when no artwork is available at all.
    pub fn fallback(&self) -> Vec<Color> {
        self.diversify(Vec::new())
            .into_iter()
            .map(|c| self.correct(c))
            .collect()
    }

    /// Tile the boosted image and retain up to [`MAX_CANDIDATES`]
    /// hue-separated samples, most saturated first.
    fn candidates(&self, img: &DynamicImage) -> Vec<Color> {
        let boosted = boost(img);
        let tile = SAMPLE_SIZE / TILE_GRID;

        // (color, hue, saturation) per retained candidate
        let mut retained: Vec<(Color, f32, f32)> = Vec::new();

        for ty in 0..TILE_GRID {
            for tx in 0..TILE_GRID {
                let Some(color) = tile_mean(&boosted, tx * tile, ty * tile, tile) else {
                    continue;
                };
                let (hue, sat, light) = rgb_to_hsl(color.r, color.g, color.b);
                if light < LIGHTNESS_MIN || light > LIGHTNESS_MAX {
                    continue;
                }

                match retained
                    .iter()
                    .position(|(_, h, _)| hue_delta(*h, hue) < HUE_SEPARATION)
                {
                    None => {
                        if retained.len() < MAX_CANDIDATES {
                            retained.push((color, hue, sat));
                        } else if let Some(weakest) = retained
                            .iter()
                            .enumerate()
                            .min_by(|(_, a), (_, b)| a.2.total_cmp(&b.2))
                            .map(|(i, _)| i)
                        {
                            if retained[weakest].2 < sat {
                                retained[weakest] = (color, hue, sat);
                            }
                        }
                    }
                    Some(near) => {
                        if retained[near].2 < sat {
                            retained[near] = (color, hue, sat);
                        }
                    }
                }
            }
        }

        retained.sort_by(|a, b| b.2.total_cmp(&a.2));
        retained.into_iter().map(|(c, _, _)| c).collect()
    }

    /// Pick N pairwise-distinguishable colors from the ranked candidates,
    /// synthesizing replacements when the image lacks variety.
    fn diversify(&self, ranked: Vec<Color>) -> Vec<Color> {
        let n = self.cfg.size.max(1);
        let threshold = self.cfg.similarity_threshold;

        let Some(&primary) = ranked.first() else {
            return (0..n)
                .map(|i| FALLBACK_CYCLE[i % FALLBACK_CYCLE.len()])
                .collect();
        };

        let mut selected = vec![primary];
        let distinct = |sel: &[Color], c: &Color| sel.iter().all(|s| s.distance(c) >= threshold);

        for candidate in ranked.iter().skip(1) {
            if selected.len() >= n {
                break;
            }
            if distinct(&selected, candidate) {
                selected.push(*candidate);
            }
        }

        // Simple transforms of the primary before resorting to the hue wheel.
        if selected.len() < n {
            for synth in [
                primary.rotate_channels(),
                primary.invert(),
                primary.threshold(),
            ] {
                if selected.len() >= n {
                    break;
                }
                if distinct(&selected, &synth) {
                    selected.push(synth);
                }
            }
        }

        // Hue wheel at 360/N intervals from the primary's hue, then finer
        // steps if the image colors happen to sit on the wheel already.
        if selected.len() < n {
            let base = primary.hue();
            let mut step = 360.0 / n as f32;
            for _ in 0..3 {
                for k in 1..(360.0 / step) as usize + 1 {
                    if selected.len() >= n {
                        break;
                    }
                    let hue = (base + step * k as f32) % 360.0;
                    let synth = hsv_to_rgb(hue, 0.9, 0.9);
                    if distinct(&selected, &synth) {
                        selected.push(synth);
                    }
                }
                if selected.len() >= n {
                    break;
                }
                step /= 2.0;
            }
        }

        // Pathological thresholds only: fill from the fallback cycle so the
        // palette length invariant still holds.
        let mut i = 0;
        while selected.len() < n {
            selected.push(FALLBACK_CYCLE[i % FALLBACK_CYCLE.len()]);
            i += 1;
        }

        selected
    }

    /// Enforce brightness and saturation floors, clamped to [0, 255].
    fn correct(&self, color: Color) -> Color {
        let mut c = color;

        let avg = c.brightness();
        if avg < self.cfg.min_brightness {
            if c.r.max(c.g).max(c.b) == 0 {
                // Pure black has no hue to preserve.
                let v = self.cfg.min_brightness.min(255.0).round() as u8;
                c = Color::new(v, v, v);
            } else {
                let scale = self.cfg.min_brightness / avg;
                let lift = |ch: u8| ((ch as f32 * scale).round().min(255.0)).max(0.0) as u8;
                c = Color::new(lift(c.r), lift(c.g), lift(c.b));
            }
        }

        if c.saturation() < self.cfg.min_saturation {
            let max = c.r.max(c.g).max(c.b);
            let min = c.r.min(c.g).min(c.b);
            if max > min {
                // Widen the channel spread until (max-min)/max hits the floor.
                let k = (max as f32 * self.cfg.min_saturation) / (max as f32 - min as f32);
                let push = |ch: u8| {
                    (max as f32 - (max as f32 - ch as f32) * k)
                        .round()
                        .clamp(0.0, 255.0) as u8
                };
                c = Color::new(push(c.r), push(c.g), push(c.b));
            }
        }

        c
    }
}

/// Resample and bias the artwork toward vivid tones before sampling.
fn boost(img: &DynamicImage) -> RgbImage {
    let small = img
        .resize_exact(SAMPLE_SIZE, SAMPLE_SIZE, imageops::FilterType::Triangle)
        .to_rgb8();
    let mut boosted = imageops::contrast(&small, CONTRAST_BOOST);
    for px in boosted.pixels_mut() {
        let [r, g, b] = px.0;
        let (h, s, l) = rgb_to_hsl(r, g, b);
        let c = hsl_to_rgb(h, (s * SATURATION_BOOST).min(1.0), l);
        px.0 = [c.r, c.g, c.b];
    }
    boosted
}

fn tile_mean(img: &RgbImage, x0: u32, y0: u32, size: u32) -> Option<Color> {
    if size == 0 {
        return None;
    }
    let (mut r, mut g, mut b) = (0u32, 0u32, 0u32);
    let mut count = 0u32;
    for y in y0..(y0 + size).min(img.height()) {
        for x in x0..(x0 + size).min(img.width()) {
            let [pr, pg, pb] = img.get_pixel(x, y).0;
            r += pr as u32;
            g += pg as u32;
            b += pb as u32;
            count += 1;
        }
    }
    if count == 0 {
        return None;
    }
    Some(Color::new(
        (r / count) as u8,
        (g / count) as u8,
        (b / count) as u8,
    ))
}

fn hue_delta(a: f32, b: f32) -> f32 {
    let d = (a - b).abs() % 360.0;
    d.min(360.0 - d)
}

/// Hue in degrees, saturation and lightness in [0, 1].
fn rgb_to_hsl(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;

    if (max - min).abs() < f32::EPSILON {
        return (0.0, 0.0, l);
    }

    let d = max - min;
    let s = if l > 0.5 {
        d / (2.0 - max - min)
    } else {
        d / (max + min)
    };
    let h = if max == r {
        60.0 * (((g - b) / d) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / d + 2.0)
    } else {
        60.0 * ((r - g) / d + 4.0)
    };
    (h.rem_euclid(360.0), s, l)
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> Color {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = l - c / 2.0;
    let (r, g, b) = sector(h, c, x);
    Color::new(
        ((r + m) * 255.0).round().clamp(0.0, 255.0) as u8,
        ((g + m) * 255.0).round().clamp(0.0, 255.0) as u8,
        ((b + m) * 255.0).round().clamp(0.0, 255.0) as u8,
    )
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Color {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = sector(h, c, x);
    Color::new(
        ((r + m) * 255.0).round().clamp(0.0, 255.0) as u8,
        ((g + m) * 255.0).round().clamp(0.0, 255.0) as u8,
        ((b + m) * 255.0).round().clamp(0.0, 255.0) as u8,
    )
}

fn sector(h: f32, c: f32, x: f32) -> (f32, f32, f32) {
    match h.rem_euclid(360.0) as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    }
}
