//! Second stage channeliser sizing.
//!
//! The FPGA splits the sampled band into `first_stage_channels` coarse channels.
//! The spectrometer then runs an FFT of `fft_length` points over each coarse
//! channel and accumulates `accumulate_count` spectra per output dump. Given
//! what the operator asked for (resolution and integration time) we pick the
//! smallest FFT that is at least as fine as requested and the smallest number
//! of accumulations that integrates for at least as long as requested.

use crate::{
    error::{Error, Result},
    units::Quantity,
};

/// Largest FFT the spectrometer supports
pub const MAX_FFT_LENGTH: u64 = 1 << 28;

// Relative slack when rounding up, so 5.000000000001 accumulations are 5
const ROUNDING_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ChannelizationResult {
    pub first_stage_channels: u32,
    pub fft_length: u64,
    pub accumulate_count: u64,
    /// Hz
    pub actual_resolution: f64,
    /// Seconds
    pub actual_integration_time: f64,
    pub total_channels: u64,
}

/// Round up to the next integer, unless `x` already is one to within float noise
fn ceil_count(x: f64) -> f64 {
    let nearest = x.round();
    if (x - nearest).abs() <= ROUNDING_TOLERANCE * nearest.abs().max(1.0) {
        nearest
    } else {
        x.ceil()
    }
}

/// Derive FFT length and accumulation count from the instrument's sampling
/// rate and the requested resolution and integration time.
pub fn plan(
    sampling_rate: Quantity,
    first_stage_channels: u32,
    resolution: Quantity,
    integration_time: Quantity,
) -> Result<ChannelizationResult> {
    if first_stage_channels == 0 {
        return Err(Error::Configuration(
            "first stage channeliser needs at least one channel".to_owned(),
        ));
    }
    let sampling_rate = sampling_rate.to_hz()?;
    let resolution = resolution.to_hz()?;
    // Integration time × resolution must cancel to a plain count
    let integration_time = integration_time.to_seconds()?;

    let channel_bandwidth = sampling_rate / first_stage_channels as f64;
    let required = ceil_count(channel_bandwidth / resolution).max(1.0);
    if required > MAX_FFT_LENGTH as f64 {
        return Err(Error::ResolutionUnattainable {
            required: required as u64,
            max: MAX_FFT_LENGTH,
        });
    }
    let fft_length = (required as u64).next_power_of_two();
    if fft_length > MAX_FFT_LENGTH {
        return Err(Error::ResolutionUnattainable {
            required: fft_length,
            max: MAX_FFT_LENGTH,
        });
    }

    let actual_resolution = channel_bandwidth / fft_length as f64;
    let accumulate_count = ceil_count(integration_time * actual_resolution).max(1.0) as u64;
    let actual_integration_time = accumulate_count as f64 / actual_resolution;

    Ok(ChannelizationResult {
        first_stage_channels,
        fft_length,
        accumulate_count,
        actual_resolution,
        actual_integration_time,
        total_channels: first_stage_channels as u64 * fft_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Unit;

    #[test]
    fn test_typical_plan() {
        let plan = plan(
            Quantity::new(1.0, Unit::GHz),
            16,
            Quantity::new(1.0, Unit::KHz),
            Quantity::new(1.0, Unit::S),
        )
        .unwrap();
        // 62.5 MHz channels / 1 kHz = 62500 -> 65536
        assert_eq!(plan.fft_length, 65536);
        assert_eq!(plan.total_channels, 16 * 65536);
        assert!((plan.actual_resolution - 62.5e6 / 65536.0).abs() < 1e-9);
        assert_eq!(plan.accumulate_count, 954);
        assert!(plan.actual_integration_time >= 1.0);
    }

    #[test]
    fn test_exact_values_are_not_rounded_up() {
        let plan = plan(
            Quantity::hz(1024.0),
            1,
            Quantity::hz(4.0),
            Quantity::new(5000.0, Unit::Ms),
        )
        .unwrap();
        assert_eq!(plan.fft_length, 256);
        assert_eq!(plan.actual_resolution, 4.0);
        // 5 s × 4 Hz is exactly 20
        assert_eq!(plan.accumulate_count, 20);
        assert_eq!(plan.actual_integration_time, 5.0);
    }

    #[test]
    fn test_accumulate_at_least_one() {
        let plan = plan(
            Quantity::hz(1e6),
            1,
            Quantity::hz(1e5),
            Quantity::new(1.0, Unit::Ns),
        )
        .unwrap();
        assert_eq!(plan.accumulate_count, 1);
    }

    #[test]
    fn test_power_of_two_bracket() {
        for &rate in &[1.0e6, 1.75e9, 2.4e6, 3.0e8] {
            for &nchans in &[1u32, 2, 16, 1024] {
                for &res in &[1.0, 7.3, 100.0, 12_345.0] {
                    let cbw = rate / nchans as f64;
                    if res > cbw || cbw / res > MAX_FFT_LENGTH as f64 {
                        continue;
                    }
                    let p = plan(
                        Quantity::hz(rate),
                        nchans,
                        Quantity::hz(res),
                        Quantity::seconds(0.25),
                    )
                    .unwrap();
                    assert!(p.fft_length.is_power_of_two());
                    assert!(cbw / p.fft_length as f64 <= res * (1.0 + 1e-9));
                    if p.fft_length > 1 {
                        assert!(res < cbw / (p.fft_length / 2) as f64);
                    }
                    // Smallest count reaching the requested integration time
                    let n = p.accumulate_count as f64;
                    assert!(n / p.actual_resolution >= 0.25 * (1.0 - 1e-9));
                    if p.accumulate_count > 1 {
                        assert!((n - 1.0) / p.actual_resolution < 0.25);
                    }
                }
            }
        }
    }

    #[test]
    fn test_resolution_unattainable() {
        let err = plan(
            Quantity::hz(1e9),
            1,
            Quantity::hz(1.0),
            Quantity::seconds(1.0),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ResolutionUnattainable { .. }));
    }

    #[test]
    fn test_largest_fft_is_allowed() {
        let p = plan(
            Quantity::hz(MAX_FFT_LENGTH as f64),
            1,
            Quantity::hz(1.0),
            Quantity::seconds(1.0),
        )
        .unwrap();
        assert_eq!(p.fft_length, MAX_FFT_LENGTH);
    }

    #[test]
    fn test_unit_mismatch() {
        let err = plan(
            Quantity::hz(1e9),
            16,
            Quantity::new(1.0, Unit::KHz),
            Quantity::new(1.0, Unit::KHz),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnitMismatch { .. }));
    }
}
