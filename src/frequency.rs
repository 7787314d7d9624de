use crate::error::ScanError;

/// Number of decimal places kept on generated frequency points
pub const FREQUENCY_DECIMALS: u32 = 2;

/// Generate a logarithmically spaced list of frequencies from `start` to `stop`
///
/// The ratio between neighbouring points is `10^((log10(stop) - log10(start)) / (count - 1))`.
/// The final point is `stop` itself rather than `start * r^(count-1)`, and every
/// point is truncated (not rounded) to two decimal places.
///
/// `start > stop` produces a descending sweep, `start == stop` a flat one.
///
/// # Examples
/// ```
/// use impedance_scan::frequency::generate_log_steps;
///
/// let steps = generate_log_steps(20.0, 2_000_000.0, 5).unwrap();
/// assert_eq!(steps.len(), 5);
/// assert_eq!(steps[0], 20.0);
/// assert_eq!(steps[4], 2_000_000.0);
/// ```
pub fn generate_log_steps(start: f64, stop: f64, count: usize) -> Result<Vec<f64>, ScanError> {
    if count < 2 {
        return Err(ScanError::InvalidArgument(format!(
            "frequency sweep needs at least 2 points, got {count}"
        )));
    }
    if !(start > 0.0) || !(stop > 0.0) {
        return Err(ScanError::InvalidArgument(format!(
            "frequency bounds must be positive (got {start} to {stop})"
        )));
    }

    let ratio = 10f64.powf((stop.log10() - start.log10()) / (count - 1) as f64);

    let mut steps: Vec<f64> = (0..count - 1)
        .map(|i| start * ratio.powi(i as i32))
        .collect();
    steps.push(stop);

    Ok(steps
        .into_iter()
        .map(|f| truncate_to(f, FREQUENCY_DECIMALS))
        .collect())
}

/// Truncate toward zero to a fixed number of decimal places
pub fn truncate_to(value: f64, decimals: u32) -> f64 {
    if decimals == 0 {
        return value.trunc();
    }
    let factor = 10f64.powi(decimals as i32);
    (value * factor).trunc() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascending_sweep_is_monotonic_and_bounded() {
        let steps = generate_log_steps(20.0, 1_000_000.0, 50).unwrap();

        assert_eq!(steps.len(), 50);
        assert_eq!(steps[0], 20.0);
        assert_eq!(*steps.last().unwrap(), 1_000_000.0);
        assert!(steps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_reference_five_point_sweep() {
        let steps = generate_log_steps(20.0, 2_000_000.0, 5).unwrap();
        let ratio = 10f64.powf(100_000f64.log10() / 4.0);

        let expected: Vec<f64> = (0..4)
            .map(|i| 20.0 * ratio.powi(i))
            .chain(std::iter::once(2_000_000.0))
            .collect();
        for (got, want) in steps.iter().zip(expected) {
            assert!((got - want).abs() < 0.011, "{got} vs {want}");
        }
        assert_eq!(steps[4], 2_000_000.0);
    }

    #[test]
    fn test_reversed_sweep_mirrors_endpoints() {
        let up = generate_log_steps(100.0, 10_000.0, 10).unwrap();
        let down = generate_log_steps(10_000.0, 100.0, 10).unwrap();

        assert_eq!(down[0], up[9]);
        assert_eq!(down[9], up[0]);
        assert!(down.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_flat_sweep_repeats_value() {
        let steps = generate_log_steps(1234.5, 1234.5, 4).unwrap();
        assert_eq!(steps.len(), 4);
        for f in steps {
            assert!((f - 1234.5).abs() < 0.01);
        }
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(matches!(
            generate_log_steps(20.0, 1000.0, 1),
            Err(ScanError::InvalidArgument(_))
        ));
        assert!(matches!(
            generate_log_steps(0.0, 1000.0, 10),
            Err(ScanError::InvalidArgument(_))
        ));
        assert!(matches!(
            generate_log_steps(20.0, -5.0, 10),
            Err(ScanError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_truncation_is_toward_zero() {
        assert_eq!(truncate_to(12.349, 2), 12.34);
        assert_eq!(truncate_to(-12.349, 2), -12.34);
        assert_eq!(truncate_to(7.9, 0), 7.0);
    }
}
