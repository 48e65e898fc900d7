//! Numerical dispersion check.
//!
//! Estimates the highest significant frequency of all waveforms and checks
//! that the shortest wavelength in the model is sampled by enough cells.

use std::f64::consts::PI;

use num::Complex;

use crate::{
    error::Error,
    grid::Grid,
    material::MaterialId,
    waveform::{
        Waveform,
        WaveformShape,
    },
};

/// Minimum number of cells per shortest wavelength.
pub const MIN_GRID_SAMPLING: usize = 3;

/// Drop from the peak power (dB) that defines the maximum frequency.
pub const HIGHEST_FREQUENCY_THRESHOLD: f64 = 60.0;

/// Phase velocity error (%) above which a warning is logged.
pub const MAX_NUMERICAL_DISPERSION: f64 = 2.0;

#[derive(Clone, Debug, PartialEq)]
pub struct DispersionAnalysis {
    pub max_frequency: f64,
    /// Material with the highest permittivity at the maximum frequency.
    pub material: MaterialId,
    /// Cells per shortest wavelength.
    pub cells_per_wavelength: f64,
    /// Courant number `c dt / delta`.
    pub courant: f64,
    /// Numerical phase velocity error in percent, if the grid sampling is
    /// physical.
    pub phase_velocity_error: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Unavailable {
    #[error("no waveforms")]
    NoWaveforms,
    #[error("impulse waveform '{0}' used")]
    Impulse(String),
    #[error("waveform '{0}' does not fit within the time window and is truncated")]
    Truncated(String),
    #[error("unable to find the maximum frequency of waveform '{0}', most likely due to undersampling")]
    Undersampled(String),
}

/// Power spectrum in dB, shifted so the peak is at 0 dB.
///
/// Returns the non-negative frequency bins only.
pub fn power_spectrum(samples: &[f64], dt: f64) -> (Vec<f64>, Vec<f64>) {
    let n = samples.len();
    let half = n / 2 + 1;

    let mut power = (0..half)
        .map(|k| {
            let omega = -2.0 * PI * k as f64 / n as f64;
            let sum = samples
                .iter()
                .enumerate()
                .map(|(t, x)| Complex::from_polar(*x, omega * t as f64))
                .sum::<Complex<f64>>();
            let power = 10.0 * sum.norm_sqr().log10();
            if power.is_finite() { power } else { 0.0 }
        })
        .collect::<Vec<_>>();

    let max = power.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    for p in &mut power {
        *p -= max;
    }

    let frequencies = (0..half).map(|k| k as f64 / (n as f64 * dt)).collect();
    (frequencies, power)
}

/// Highest significant frequency of one waveform, `Ok(None)` if it doesn't
/// contribute.
fn max_frequency(
    waveform: &Waveform,
    dt: f64,
    iterations: usize,
) -> Result<Option<f64>, Unavailable> {
    match waveform.shape {
        WaveformShape::Sine | WaveformShape::ContSine => return Ok(Some(4.0 * waveform.frequency)),
        WaveformShape::Impulse => return Err(Unavailable::Impulse(waveform.id.clone())),
        _ => {}
    }

    let (chi, _) = waveform.gaussian_parameters().unwrap_or_default();
    let n = ((4.0 * chi / dt).round() as usize).min(iterations);
    if n < 2 {
        return Err(Unavailable::Undersampled(waveform.id.clone()));
    }

    let samples = (0..n)
        .map(|iteration| waveform.value(iteration as f64 * dt, dt))
        .collect::<Vec<_>>();
    let peak = samples.iter().fold(0.0f64, |max, x| max.max(x.abs()));

    if peak == 0.0 {
        return Ok(None);
    }
    if samples[n - 1].abs() >= peak / 100.0 {
        return Err(Unavailable::Truncated(waveform.id.clone()));
    }

    let (frequencies, power) = power_spectrum(&samples, dt);
    let peak_bin = power
        .iter()
        .position(|p| *p == 0.0)
        .ok_or_else(|| Unavailable::Undersampled(waveform.id.clone()))?;
    let threshold = power[peak_bin..]
        .iter()
        .position(|p| *p < -HIGHEST_FREQUENCY_THRESHOLD)
        .ok_or_else(|| Unavailable::Undersampled(waveform.id.clone()))?;

    Ok(Some(frequencies[peak_bin + threshold]))
}

pub fn analyse(grid: &Grid) -> Result<DispersionAnalysis, Unavailable> {
    let mut max = None;
    for waveform in grid.waveforms() {
        if let Some(frequency) = max_frequency(waveform, grid.dt(), grid.iterations())? {
            max = Some(max.map_or(frequency, |max: f64| max.max(frequency)));
        }
    }
    let max_frequency = max.ok_or(Unavailable::NoWaveforms)?;

    let constants = grid.physical_constants();
    let (material, er) = grid
        .materials()
        .iter()
        .filter(|(_, material)| !material.is_pec())
        .map(|(id, material)| {
            let er = if material.is_dispersive() {
                material.relative_permittivity_at(max_frequency, constants).re
            }
            else {
                material.relative_permittivity
            };
            (id, er)
        })
        .fold((0, 0.0), |(id_max, er_max), (id, er)| {
            if er > er_max { (id, er) } else { (id_max, er_max) }
        });

    let c = constants.speed_of_light();
    let min_wavelength = c / er.sqrt() / max_frequency;

    let invariant = grid.mode().invariant_axis().map(|axis| axis.index());
    let delta = (0..3)
        .filter(|axis| Some(*axis) != invariant)
        .map(|axis| grid.spacing()[axis])
        .fold(0.0, f64::max);

    let courant = c * grid.dt() / delta;
    let cells_per_wavelength = min_wavelength / delta;

    let phase_velocity_error = (cells_per_wavelength.floor() as usize >= MIN_GRID_SAMPLING)
        .then(|| {
            let vp = PI
                / (cells_per_wavelength
                    * ((PI * courant / cells_per_wavelength).sin() / courant).asin());
            (vp - 1.0) * 100.0
        });

    Ok(DispersionAnalysis {
        max_frequency,
        material,
        cells_per_wavelength,
        courant,
        phase_velocity_error,
    })
}

/// Fails on non-physical propagation, warns about significant numerical
/// dispersion.
pub fn check(grid: &Grid) -> Result<(), Error> {
    let analysis = match analyse(grid) {
        Ok(analysis) => analysis,
        Err(Unavailable::NoWaveforms) => return Ok(()),
        Err(reason) => {
            tracing::warn!(%reason, "numerical dispersion analysis not carried out");
            return Ok(());
        }
    };

    let material = &grid.materials().get(analysis.material).name;
    let cells = analysis.cells_per_wavelength.floor() as usize;

    if cells < MIN_GRID_SAMPLING {
        return Err(Error::NonPhysicalPropagation {
            material: material.clone(),
            cells_per_wavelength: cells,
            minimum: MIN_GRID_SAMPLING,
            max_frequency: analysis.max_frequency,
        });
    }

    if let Some(error) = analysis.phase_velocity_error
        && error > MAX_NUMERICAL_DISPERSION
    {
        tracing::warn!(
            material,
            phase_velocity_error = error,
            max_frequency = analysis.max_frequency,
            cells_per_wavelength = cells,
            "potentially significant numerical dispersion"
        );
    }
    else {
        tracing::debug!(?analysis, "numerical dispersion analysis");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use super::{
        Unavailable,
        analyse,
        power_spectrum,
    };
    use crate::{
        error::Error,
        grid::{
            Grid,
            tests::empty_model,
        },
        material::{
            Material,
            PhysicalConstants,
        },
        waveform::{
            Waveform,
            WaveformShape,
        },
    };

    #[test]
    fn spectrum_of_a_cosine_peaks_at_its_frequency() {
        let dt = 1e-3;
        let samples = (0..100)
            .map(|t| (2.0 * std::f64::consts::PI * 50.0 * t as f64 * dt).cos())
            .collect::<Vec<_>>();
        let (frequencies, power) = power_spectrum(&samples, dt);
        let peak = power.iter().position(|p| *p == 0.0).unwrap();
        assert!((frequencies[peak] - 50.0).abs() < 1e-9);
        assert!(power[10] < -60.0);
    }

    fn grid_with(shape: WaveformShape, frequency: f64, spacing: f64, iterations: usize) -> Grid {
        let mut description = empty_model([10, 10, 10], iterations);
        description.spacing = Vector3::repeat(spacing);
        description.waveforms.push(Waveform::new("w", shape, frequency));
        description.materials.push(Material {
            relative_permittivity: 9.0,
            ..Material::new("rock")
        });
        Grid::new(&description, PhysicalConstants::SI).unwrap()
    }

    #[test]
    fn fine_grid_is_physical() {
        let grid = grid_with(WaveformShape::Ricker, 1e9, 1e-3, 3000);
        let analysis = analyse(&grid).unwrap();
        assert_eq!(analysis.material, grid.materials().find("rock").unwrap());
        assert!(analysis.max_frequency > 1e9 && analysis.max_frequency < 1e10);
        assert!(analysis.cells_per_wavelength > 10.0);
        assert!(analysis.phase_velocity_error.unwrap().abs() < 2.0);
    }

    #[test]
    fn coarse_grid_is_rejected() {
        let mut grid = grid_with(WaveformShape::Gaussian, 1e9, 0.05, 100);
        let error = grid
            .prepare(&crate::admission::HostInfo::new(u64::MAX), None)
            .unwrap_err();
        assert!(matches!(error, Error::NonPhysicalPropagation { minimum: 3, .. }));
    }

    #[test]
    fn impulse_and_truncated_waveforms_are_not_analysed() {
        let grid = grid_with(WaveformShape::Impulse, 1e9, 1e-3, 100);
        assert_eq!(analyse(&grid), Err(Unavailable::Impulse("w".to_owned())));

        let grid = grid_with(WaveformShape::Gaussian, 1e9, 1e-3, 100);
        assert_eq!(analyse(&grid), Err(Unavailable::Truncated("w".to_owned())));

        let grid = grid_with(WaveformShape::Sine, 1e9, 1e-3, 100);
        assert_eq!(analyse(&grid).unwrap().max_frequency, 4e9);
    }
}
