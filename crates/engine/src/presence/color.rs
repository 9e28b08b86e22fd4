// Presence color allocation.
//
// Colors are drawn uniformly at random from the unassigned pool and returned
// on release. Once every palette color is taken, the color held by the fewest
// peers is shared (ties go to palette order), so exclusivity only holds up to
// the palette size.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

/// Seaborn "bright" palette.
pub const SEABORN_BRIGHT: [&str; 9] = [
    "#ff7c00", // orange
    "#1ac938", // green
    "#e8000b", // red
    "#8b2be2", // purple
    "#9f4800", // brown
    "#f14cc1", // pink
    "#ffc400", // khaki
    "#00d7ff", // cyan
    "#023eff", // blue
];

pub struct ColorAllocator {
    palette: Vec<String>,
    unassigned: Vec<String>,
    holders: HashMap<String, usize>,
    rng: StdRng,
}

impl Default for ColorAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ColorAllocator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic allocation order, for tests and replays.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self::with_palette(SEABORN_BRIGHT.iter().map(|c| c.to_string()).collect(), rng)
    }

    pub fn with_palette(palette: Vec<String>, rng: StdRng) -> Self {
        Self { unassigned: palette.clone(), palette, holders: HashMap::new(), rng }
    }

    pub fn allocate(&mut self) -> String {
        let color = if self.unassigned.is_empty() {
            let shared = self
                .palette
                .iter()
                .min_by_key(|color| self.holders.get(*color).copied().unwrap_or(0))
                .cloned()
                .unwrap_or_default();
            warn!(color = %shared, palette = self.palette.len(), "presence palette exhausted, sharing a color");
            shared
        } else {
            let index = self.rng.gen_range(0..self.unassigned.len());
            self.unassigned.swap_remove(index)
        };

        *self.holders.entry(color.clone()).or_insert(0) += 1;
        color
    }

    /// Returns a color to the pool once its last holder releases it.
    pub fn release(&mut self, color: &str) {
        match self.holders.get_mut(color) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.holders.remove(color);
                if self.palette.iter().any(|c| c == color) {
                    self.unassigned.push(color.to_string());
                }
            }
            None => warn!(color = %color, "released a color that was not allocated"),
        }
    }

    pub fn available(&self) -> usize {
        self.unassigned.len()
    }

    pub fn palette(&self) -> &[String] {
        &self.palette
    }
}
