use std::f64::consts::{
    E,
    PI,
    SQRT_2,
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::error::Error;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WaveformShape {
    Gaussian,
    GaussianDot,
    GaussianDotNorm,
    GaussianDotDot,
    GaussianDotDotNorm,
    GaussianPrime,
    GaussianDoublePrime,
    Ricker,
    Sine,
    ContSine,
    Impulse,
}

fn default_amplitude() -> f64 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    pub id: String,
    #[serde(rename = "type")]
    pub shape: WaveformShape,
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
    /// Centre frequency in Hz.
    pub frequency: f64,
}

impl Waveform {
    pub fn new(id: impl Into<String>, shape: WaveformShape, frequency: f64) -> Self {
        Self {
            id: id.into(),
            shape,
            amplitude: 1.0,
            frequency,
        }
    }

    /// Delay `chi` and width `zeta` of the gaussian family.
    pub fn gaussian_parameters(&self) -> Option<(f64, f64)> {
        let f = self.frequency;
        match self.shape {
            WaveformShape::Gaussian
            | WaveformShape::GaussianDot
            | WaveformShape::GaussianDotNorm
            | WaveformShape::GaussianPrime
            | WaveformShape::GaussianDoublePrime => Some((1.0 / f, 2.0 * PI.powi(2) * f.powi(2))),
            WaveformShape::GaussianDotDot
            | WaveformShape::GaussianDotDotNorm
            | WaveformShape::Ricker => Some((SQRT_2 / f, PI.powi(2) * f.powi(2))),
            WaveformShape::Sine | WaveformShape::ContSine | WaveformShape::Impulse => None,
        }
    }

    /// Value at `time` seconds after the source switches on.
    pub fn value(&self, time: f64, dt: f64) -> f64 {
        let f = self.frequency;
        let (chi, zeta) = self.gaussian_parameters().unwrap_or_default();
        let delay = time - chi;
        let gaussian = (-zeta * delay.powi(2)).exp();
        let first_derivative = -2.0 * zeta * delay * gaussian;
        let second_derivative = 2.0 * zeta * (2.0 * zeta * delay.powi(2) - 1.0) * gaussian;

        let value = match self.shape {
            WaveformShape::Gaussian => gaussian,
            WaveformShape::GaussianDot | WaveformShape::GaussianPrime => first_derivative,
            WaveformShape::GaussianDotNorm => first_derivative * (E / (2.0 * zeta)).sqrt(),
            WaveformShape::GaussianDotDot | WaveformShape::GaussianDoublePrime => {
                second_derivative
            }
            WaveformShape::GaussianDotDotNorm => second_derivative / (2.0 * zeta),
            WaveformShape::Ricker => -second_derivative / (2.0 * zeta),
            WaveformShape::Sine => {
                if time * f > 1.0 {
                    0.0
                }
                else {
                    (2.0 * PI * f * time).sin()
                }
            }
            WaveformShape::ContSine => {
                let ramp = (0.25 * time * f).min(1.0);
                ramp * (2.0 * PI * f * time).sin()
            }
            WaveformShape::Impulse => {
                if time < dt {
                    1.0
                }
                else {
                    0.0
                }
            }
        };

        value * self.amplitude
    }
}

pub fn find_waveform<'a>(waveforms: &'a [Waveform], id: &str) -> Result<&'a Waveform, Error> {
    waveforms
        .iter()
        .find(|waveform| waveform.id == id)
        .ok_or_else(|| Error::UnknownWaveform(id.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::{
        Waveform,
        WaveformShape,
    };

    fn peak(waveform: &Waveform, dt: f64, samples: usize) -> (usize, f64) {
        (0..samples)
            .map(|i| (i, waveform.value(i as f64 * dt, dt)))
            .fold((0, 0.0), |(i_max, max), (i, v)| {
                if v.abs() > max { (i, v.abs()) } else { (i_max, max) }
            })
    }

    #[test]
    fn gaussian_peaks_at_delay() {
        let f = 1e9;
        let waveform = Waveform::new("g", WaveformShape::Gaussian, f);
        let dt = 1e-12;
        let (i, value) = peak(&waveform, dt, 3000);
        assert_eq!(i, 1000);
        assert!((value - 1.0).abs() < 1e-9);
        assert!(waveform.value(0.0, dt) < 1e-8);
    }

    #[test]
    fn normalised_waveforms_have_unit_peak() {
        let dt = 1e-13;
        for shape in [
            WaveformShape::GaussianDotNorm,
            WaveformShape::GaussianDotDotNorm,
            WaveformShape::Ricker,
        ] {
            let waveform = Waveform::new("w", shape, 1.5e9);
            let (_, value) = peak(&waveform, dt, 40000);
            assert!((value - 1.0).abs() < 1e-3, "{shape}: {value}");
        }
        let ricker = Waveform::new("r", WaveformShape::Ricker, 1.5e9);
        let (chi, _) = ricker.gaussian_parameters().unwrap();
        assert!((ricker.value(chi, dt) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sine_stops_after_one_period() {
        let waveform = Waveform {
            amplitude: 2.0,
            ..Waveform::new("s", WaveformShape::Sine, 1e9)
        };
        assert!((waveform.value(0.25e-9, 1e-12) - 2.0).abs() < 1e-9);
        assert_eq!(waveform.value(1.1e-9, 1e-12), 0.0);
    }

    #[test]
    fn impulse_only_in_first_step() {
        let waveform = Waveform::new("i", WaveformShape::Impulse, 0.0);
        assert_eq!(waveform.value(0.0, 1e-12), 1.0);
        assert_eq!(waveform.value(0.5e-12, 1e-12), 1.0);
        assert_eq!(waveform.value(1e-12, 1e-12), 0.0);
    }
}
