use textplots::{Chart, Plot, Shape};

use crate::error::ScanError;
use crate::sweep::ResultTable;

/// Size of the SI unit and its prefix that bring `magnitude` into [1, 1000)
fn determine_scale(magnitude: f64) -> (f64, &'static str) {
    if magnitude >= 1e9 {
        (1e9, "G")
    } else if magnitude >= 1e6 {
        (1e6, "M")
    } else if magnitude >= 1e3 {
        (1e3, "k")
    } else if magnitude >= 1.0 || magnitude == 0.0 {
        (1.0, "")
    } else if magnitude >= 1e-3 {
        (1e-3, "m")
    } else if magnitude >= 1e-6 {
        (1e-6, "μ")
    } else if magnitude >= 1e-9 {
        (1e-9, "n")
    } else {
        (1e-12, "p")
    }
}

/// Format a reading with an SI prefix and `sigfigs` significant figures, e.g. `1.00 nF`
pub fn format_si(value: f64, unit: &str, sigfigs: usize) -> String {
    if !value.is_finite() {
        return format!("{value} {unit}");
    }
    let (unit_size, prefix) = determine_scale(value.abs());
    let scaled = value / unit_size;
    let integer_digits = if scaled == 0.0 {
        1
    } else {
        scaled.abs().log10().floor() as i64 + 1
    };
    let decimals = (sigfigs as i64 - integer_digits).max(0) as usize;
    format!("{scaled:.decimals$} {prefix}{unit}")
}

/// Unit inside the trailing `[...]` of a column name, if any
pub fn column_unit(column: &str) -> &str {
    column
        .rsplit_once('[')
        .and_then(|(_, rest)| rest.strip_suffix(']'))
        .unwrap_or("")
}

/// Plot one column of a sweep against log10 of the frequency
pub fn plot_sweep(
    table: &ResultTable,
    column: usize,
    title: Option<&str>,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), ScanError> {
    if table.is_empty() {
        return Err(ScanError::InvalidArgument("cannot plot an empty sweep".to_string()));
    }
    let name = table.columns.get(column).ok_or_else(|| {
        ScanError::InvalidArgument(format!("sweep has no column {column}"))
    })?;

    let width = width.unwrap_or(140);
    let height = height.unwrap_or(60);

    let frequencies = table.frequencies();
    let values = table.column(column);
    let max_abs = values.iter().fold(0.0f64, |a, &b| a.max(b.abs()));
    let (value_unit, value_prefix) = determine_scale(max_abs);

    let frame: Vec<(f32, f32)> = frequencies
        .iter()
        .zip(&values)
        .filter(|(f, v)| **f > 0.0 && v.is_finite())
        .map(|(f, v)| (f.log10() as f32, (v / value_unit) as f32))
        .collect();
    if frame.is_empty() {
        return Err(ScanError::InvalidArgument(
            "no plottable points in sweep".to_string(),
        ));
    }

    let x_min = frame.iter().fold(f32::INFINITY, |a, p| a.min(p.0));
    let x_max = frame.iter().fold(f32::NEG_INFINITY, |a, p| a.max(p.0));
    // textplots needs a non-empty x range
    let x_max = if x_max > x_min { x_max } else { x_min + 1.0 };

    println!("{}", title.unwrap_or("Sweep"));
    println!(
        "X-axis: log10(Frequency [Hz]) | Y-axis: {} ({}{})",
        name,
        value_prefix,
        column_unit(name)
    );
    println!("{}", "─".repeat(width));

    Chart::new(width as u32, height as u32, x_min, x_max)
        .lineplot(&Shape::Lines(&frame))
        .nice();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MeasurementFunction;
    use crate::sweep::ResultRow;

    #[test]
    fn test_determine_scale() {
        assert_eq!(determine_scale(5.0), (1.0, ""));
        assert_eq!(determine_scale(2e6), (1e6, "M"));
        assert_eq!(determine_scale(0.005), (1e-3, "m"));
        assert_eq!(determine_scale(5e-9), (1e-9, "n"));
        assert_eq!(determine_scale(5e-12), (1e-12, "p"));
    }

    #[test]
    fn test_format_si() {
        assert_eq!(format_si(1e-9, "F", 3), "1.00 nF");
        assert_eq!(format_si(2_000_000.0, "Hz", 3), "2.00 MHz");
        assert_eq!(format_si(470.0, "Ohm", 3), "470 Ohm");
        assert_eq!(format_si(-0.0123, "S", 2), "-12 mS");
    }

    #[test]
    fn test_column_unit() {
        assert_eq!(column_unit("Capacitance (Parallel) [F]"), "F");
        assert_eq!(column_unit("Loss Tangent"), "");
    }

    #[test]
    fn test_plot_sweep() {
        let mut table = ResultTable::new(MeasurementFunction::CpD.result_columns());
        for (f, c) in [(20.0, 1.2e-9), (2000.0, 1.1e-9), (200_000.0, 1.0e-9)] {
            table.rows.push(ResultRow {
                values: vec![f, c, 0.001, 0.0],
            });
        }
        assert!(plot_sweep(&table, 1, Some("M1"), Some(60), Some(20)).is_ok());
        assert!(plot_sweep(&table, 9, None, None, None).is_err());
        assert!(plot_sweep(&ResultTable::default(), 1, None, None, None).is_err());
    }
}
