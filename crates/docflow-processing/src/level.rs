//! Mapping of the request's compression level onto encoder parameters.
//!
//! Levels run from 1 (smallest output) to 99 (best quality). Every mapping
//! goes through `t = (level - 1) / 98`, so 1 maps to `t = 0` and 99 to
//! `t = 1`.

pub const MIN_LEVEL: u8 = 1;
pub const MAX_LEVEL: u8 = 99;

pub fn clamp_level(level: u8) -> u8 {
    level.clamp(MIN_LEVEL, MAX_LEVEL)
}

/// Position of `level` on the 0.0..=1.0 scale.
pub fn level_fraction(level: u8) -> f64 {
    f64::from(clamp_level(level) - MIN_LEVEL) / f64::from(MAX_LEVEL - MIN_LEVEL)
}

/// zlib-style PNG compression level, 0 (fastest) to 9 (smallest).
pub fn png_compression_level(level: u8) -> u8 {
    (9.0 - level_fraction(level) * 9.0).round().clamp(0.0, 9.0) as u8
}

/// x264/VP9 constant rate factor, 18 (best) to 36 (smallest).
pub fn crf_from_level(level: u8) -> u8 {
    (36.0 - level_fraction(level) * 18.0).round().clamp(18.0, 36.0) as u8
}

/// Audio bitrate in kbit/s, 48 to 192.
pub fn audio_kbps_from_level(level: u8) -> u32 {
    (48.0 + level_fraction(level) * 144.0).round().clamp(48.0, 192.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_map_to_extremes() {
        assert_eq!(level_fraction(1), 0.0);
        assert_eq!(level_fraction(99), 1.0);
        assert_eq!(level_fraction(0), 0.0);
        assert_eq!(level_fraction(200), 1.0);

        assert_eq!(png_compression_level(1), 9);
        assert_eq!(png_compression_level(99), 0);
        assert_eq!(crf_from_level(1), 36);
        assert_eq!(crf_from_level(99), 18);
        assert_eq!(audio_kbps_from_level(1), 48);
        assert_eq!(audio_kbps_from_level(99), 192);
    }

    #[test]
    fn default_level_mapping() {
        // t = 79 / 98
        assert_eq!(png_compression_level(80), 2);
        assert_eq!(crf_from_level(80), 21);
        assert_eq!(audio_kbps_from_level(80), 164);
    }

    #[test]
    fn midpoint_mapping() {
        // t = 0.5
        assert_eq!(png_compression_level(50), 5);
        assert_eq!(crf_from_level(50), 27);
        assert_eq!(audio_kbps_from_level(50), 120);
    }
}
