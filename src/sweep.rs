//! Centre frequencies for stepping the analyser across a band.
//!
//! Each step covers one analysis bandwidth. The first centre sits half a
//! bandwidth above `start`, and steps are added only while the band covered so
//! far still ends short of `end`. So a band that is an exact multiple of the
//! bandwidth gets exactly that many steps, while any remainder costs one more
//! step whose upper edge runs past `end`.

use crate::error::{Error, Result};

/// Plan centre frequencies (Hz) covering `[start, end]` in steps of `bandwidth`.
///
/// Always yields at least one centre, and for every centre `c`,
/// `c - bandwidth/2 < end`. `tag` names the measurement in errors.
pub fn centre_frequencies(tag: &str, start: f64, end: f64, bandwidth: f64) -> Result<Vec<f64>> {
    if !(bandwidth > 0.0) || !bandwidth.is_finite() {
        return Err(Error::InvalidMeasurement {
            tag: tag.to_owned(),
            reason: format!("analysis bandwidth {bandwidth} Hz is not a positive step"),
        });
    }
    if !(start < end) {
        return Err(Error::InvalidMeasurement {
            tag: tag.to_owned(),
            reason: format!("frequency range start {start} Hz is not below end {end} Hz"),
        });
    }

    let half = bandwidth / 2.0;
    let mut centres = vec![start + half];
    // Computed from the index rather than accumulated, so rounding doesn't drift
    let mut step = 1u64;
    loop {
        let lower_edge = start + step as f64 * bandwidth;
        if lower_edge >= end {
            break;
        }
        centres.push(lower_edge + half);
        step += 1;
    }
    Ok(centres)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remainder_adds_a_step() {
        let centres = centre_frequencies("band", 0.0, 100.0, 40.0).unwrap();
        assert_eq!(centres, vec![20.0, 60.0, 100.0]);
    }

    #[test]
    fn test_exact_multiple() {
        let centres = centre_frequencies("band", 0.0, 80.0, 40.0).unwrap();
        assert_eq!(centres, vec![20.0, 60.0]);
    }

    #[test]
    fn test_narrow_band_single_step() {
        let centres = centre_frequencies("band", 1.0e9, 1.001e9, 40.0e6).unwrap();
        assert_eq!(centres, vec![1.02e9]);
    }

    #[test]
    fn test_sweep_properties() {
        let cases = [
            (0.0, 100.0, 40.0),
            (70e6, 6e9, 160e6),
            (1.2e9, 1.5e9, 1e6),
            (10.0, 10.5, 3.0),
        ];
        for (start, end, bw) in cases {
            let centres = centre_frequencies("band", start, end, bw).unwrap();
            assert!(!centres.is_empty());
            assert_eq!(centres[0], start + bw / 2.0);
            for c in &centres {
                assert!(c - bw / 2.0 < end);
                assert!(c - bw / 2.0 >= start - bw);
            }
            for pair in centres.windows(2) {
                assert!(pair[1] > pair[0]);
                assert!(((pair[1] - pair[0]) - bw).abs() <= bw * 1e-9);
            }
            // Covers the whole band
            assert!(centres[centres.len() - 1] + bw / 2.0 >= end);
            // Same inputs, same plan
            assert_eq!(centres, centre_frequencies("band", start, end, bw).unwrap());
        }
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert!(centre_frequencies("band", 10.0, 5.0, 1.0).is_err());
        let err = centre_frequencies("l_band", 0.0, 5.0, 0.0).unwrap_err();
        assert!(matches!(&err, Error::InvalidMeasurement { tag, .. } if tag == "l_band"));
        assert!(err.to_string().starts_with("Invalid measurement 'l_band':"));
    }
}
