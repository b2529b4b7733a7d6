use std::fs;
use std::path::PathBuf;

use soundpay_core::symbols::ALPHABET;
use soundpay_core::*;

fn main() -> std::io::Result<()> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();
    let out_dir = root.join("web/src/constants");
    let out_path = out_dir.join("soundpay.ts");

    let alphabet: String = ALPHABET.iter().collect();
    let profiles = AttemptProfile::default_ladder()
        .iter()
        .map(|p| {
            format!(
                "  {{ volume: {}, toneMs: {}, silenceMs: {}, pollWindowMs: {} }},",
                p.volume, p.tone_ms, p.silence_ms, p.poll_window_ms
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let content = format!(
        r#"// AUTO-GENERATED FILE - DO NOT EDIT MANUALLY
// Generated from core/src/lib.rs constants
// Run `cargo run --manifest-path tools/Cargo.toml` to regenerate

export const ALPHABET = "{}"
export const BASE_FREQUENCY = {}
export const FREQUENCY_STEP = {}
export const SYNC_FREQUENCY = {}
export const TOKEN_PREFIX = "{}"
export const MIN_TOKEN_LEN = {}
export const MAX_TOKEN_LEN = {}
export const POLL_INTERVAL_MS = {}
export const ATTEMPT_PROFILES = [
{}
]
"#,
        alphabet,
        BASE_FREQUENCY,
        FREQUENCY_STEP,
        SYNC_FREQUENCY,
        TOKEN_PREFIX,
        MIN_TOKEN_LEN,
        MAX_TOKEN_LEN,
        POLL_INTERVAL_MS,
        profiles
    );

    fs::create_dir_all(&out_dir)?;
    fs::write(&out_path, content)?;

    println!("Generated: {}", out_path.display());
    Ok(())
}
