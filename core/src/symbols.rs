use crate::{BASE_FREQUENCY, FREQUENCY_STEP, SYNC_FREQUENCY};

// Single-tone FSK symbol map
//
// Frequency layout:
// - 22 symbols, 100 Hz apart, starting at 1800 Hz
// - Highest symbol: 3900 Hz (1800 + 21*100)
// - Sync tone sits alone at 1200 Hz, below the symbol band
//
// The map is fixed for a protocol version. Changing the alphabet order
// changes every frequency above the edited slot.

/// Ordered symbol alphabet: hex digits, the `P`/`Y` prefix letters, then separators
pub const ALPHABET: [char; 22] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'P', 'Y', '_',
    '.', '-', ':',
];

/// Number of symbols in the alphabet
pub const NUM_SYMBOLS: usize = ALPHABET.len();

/// Position of a character in the alphabet
pub fn symbol_index(c: char) -> Option<usize> {
    ALPHABET.iter().position(|&a| a == c)
}

pub fn is_symbol(c: char) -> bool {
    symbol_index(c).is_some()
}

/// Frequency for an alphabet slot
/// freq_hz = BASE_FREQUENCY + index * FREQUENCY_STEP
pub fn index_to_frequency(index: usize) -> f32 {
    BASE_FREQUENCY + (index as f32) * FREQUENCY_STEP
}

/// Tone frequency for a character, or None if the character cannot be sent
pub fn char_to_frequency(c: char) -> Option<f32> {
    symbol_index(c).map(index_to_frequency)
}

fn nearest_slot(freq: f32) -> Option<usize> {
    let slot = ((freq - BASE_FREQUENCY) / FREQUENCY_STEP).round() as i64;
    usize::try_from(slot).ok().filter(|&slot| slot < NUM_SYMBOLS)
}

/// Round a frequency to the nearest slot and return its character
/// Returns None outside `[BASE_FREQUENCY, BASE_FREQUENCY + NUM_SYMBOLS * FREQUENCY_STEP)`
pub fn frequency_to_char(freq: f32) -> Option<char> {
    let band_end = index_to_frequency(NUM_SYMBOLS);
    if !(BASE_FREQUENCY..band_end).contains(&freq) {
        return None;
    }
    nearest_slot(freq).map(|slot| ALPHABET[slot])
}

/// Nearest character whose slot centre is within `tolerance` Hz of `freq`.
/// Anything between slots is treated as noise. Unlike `frequency_to_char`,
/// a measured peak slightly below the lowest slot still matches it.
pub fn frequency_to_char_within(freq: f32, tolerance: f32) -> Option<char> {
    let slot = nearest_slot(freq)?;
    if (freq - index_to_frequency(slot)).abs() <= tolerance {
        Some(ALPHABET[slot])
    } else {
        None
    }
}

pub fn is_sync(freq: f32, tolerance: f32) -> bool {
    (freq - SYNC_FREQUENCY).abs() <= tolerance
}

/// Highest frequency any symbol tone uses
pub fn highest_symbol_frequency() -> f32 {
    index_to_frequency(NUM_SYMBOLS - 1)
}
