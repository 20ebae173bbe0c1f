//! Stable per-process colors.

use std::collections::HashMap;

/// Nord accents; readable on both dark and light backgrounds.
pub const DEFAULT_PALETTE: &[&str] = &[
    "#88c0d0", "#81a1c1", "#5e81ac", "#bf616a", "#d08770", "#ebcb8b", "#a3be8c", "#b48ead",
    "#8fbcbb",
];

/// Color for nodes without a process (ghosts whose anchor was also missing).
pub const UNATTRIBUTED_COLOR: &str = "#4c566a";

/// Maps process names to palette entries.
///
/// The index for a name is a pure function of the name and palette size, so
/// two palettes built from the same colors agree. The memo only saves
/// rehashing; [`ProcessPalette::reset`] drops it.
#[derive(Debug, Clone)]
pub struct ProcessPalette {
    colors: Vec<String>,
    assigned: HashMap<String, usize>,
}

impl Default for ProcessPalette {
    fn default() -> Self {
        Self::new(DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect())
    }
}

impl ProcessPalette {
    pub fn new(colors: Vec<String>) -> Self {
        Self {
            colors,
            assigned: HashMap::new(),
        }
    }

    pub fn color_for(&mut self, process: &str) -> &str {
        if process.is_empty() || self.colors.is_empty() {
            return UNATTRIBUTED_COLOR;
        }
        let len = self.colors.len();
        let index = *self
            .assigned
            .entry(process.to_string())
            .or_insert_with(|| palette_index(process, len));
        &self.colors[index]
    }

    pub fn len_assigned(&self) -> usize {
        self.assigned.len()
    }

    pub fn reset(&mut self) {
        self.assigned.clear();
    }
}

/// FNV-1a over the name, reduced modulo `len`.
pub fn palette_index(name: &str, len: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % len.max(1) as u64) as usize
}
