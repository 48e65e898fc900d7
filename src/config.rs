//! Model description.
//!
//! This is the validated command list an input-file parser produces. It can
//! also be loaded directly from TOML.

use std::path::Path;

use nalgebra::Vector3;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    error::Error,
    grid::geometry::GeometryCommand,
    material::Material,
    pml::PmlDescription,
    receiver::ReceiverDescription,
    source::SourceDescription,
    waveform::Waveform,
};

/// Length of the simulated time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    Seconds(f64),
    Iterations(usize),
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::Iterations(0)
    }
}

fn default_stability_factor() -> f64 {
    1.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDescription {
    #[serde(default)]
    pub title: String,

    /// Name of the file this was loaded from.
    #[serde(default)]
    pub input_file: Option<String>,

    /// Number of cells along each axis.
    pub cells: Vector3<usize>,

    /// Cell size in metres.
    pub spacing: Vector3<f64>,

    pub time_window: TimeWindow,

    /// Factor applied to the Courant limit.
    #[serde(default = "default_stability_factor")]
    pub time_step_stability_factor: f64,

    #[serde(default)]
    pub pml: PmlDescription,

    /// User materials. `pec` and `free_space` are always defined.
    #[serde(default)]
    pub materials: Vec<Material>,

    #[serde(default)]
    pub waveforms: Vec<Waveform>,

    #[serde(default)]
    pub sources: Vec<SourceDescription>,

    #[serde(default)]
    pub receivers: Vec<ReceiverDescription>,

    /// Per-run displacement of dipoles in metres.
    #[serde(default)]
    pub source_steps: Vector3<f64>,

    /// Per-run displacement of receivers in metres.
    #[serde(default)]
    pub receiver_steps: Vector3<f64>,

    /// Painted in order, later commands overwrite earlier ones.
    #[serde(default)]
    pub geometry: Vec<GeometryCommand>,
}

impl Default for ModelDescription {
    fn default() -> Self {
        Self {
            title: String::new(),
            input_file: None,
            cells: Vector3::repeat(1),
            spacing: Vector3::repeat(1e-3),
            time_window: TimeWindow::default(),
            time_step_stability_factor: default_stability_factor(),
            pml: PmlDescription::default(),
            materials: vec![],
            waveforms: vec![],
            sources: vec![],
            receivers: vec![],
            source_steps: Vector3::zeros(),
            receiver_steps: Vector3::zeros(),
            geometry: vec![],
        }
    }
}

impl ModelDescription {
    pub fn from_toml_str(toml: &str) -> Result<Self, Error> {
        Ok(toml::from_str(toml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let toml = std::fs::read_to_string(path)?;
        let mut description = Self::from_toml_str(&toml)?;
        if description.input_file.is_none() {
            description.input_file = Some(path.display().to_string());
        }
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{
        Point3,
        Vector3,
    };

    use super::{
        ModelDescription,
        TimeWindow,
    };
    use crate::{
        grid::{
            Axis,
            geometry::GeometryCommand,
        },
        material::Pole,
        pml::ScalingProfile,
        source::SourceKind,
        waveform::WaveformShape,
    };

    const MODEL: &str = r#"
title = "cylinder in sand"
cells = [100, 80, 1]
spacing = [0.002, 0.002, 0.002]
time_window = { seconds = 3e-9 }

[pml.thickness]
x_min = 15
x_max = 15

[pml.cfs.sigma]
profile = "cubic"

[[materials]]
name = "half_space"
relative_permittivity = 6.0
electric_conductivity = 0.0

[[materials]]
name = "wet_sand"
relative_permittivity = 4.0
poles = [{ type = "debye", delta_er = 10.0, tau = 1e-9 }]

[[waveforms]]
id = "pulse"
type = "ricker"
amplitude = 1.0
frequency = 1.5e9

[[sources]]
type = "hertzian_dipole"
polarisation = "z"
position = [0.1, 0.07, 0.0]
waveform = "pulse"

[[sources]]
type = "voltage_source"
resistance = 50.0
polarisation = "z"
position = [0.11, 0.07, 0.0]
waveform = "pulse"

[[receivers]]
position = [0.14, 0.07, 0.0]

[[geometry]]
type = "box"
lower = [0.0, 0.0, 0.0]
upper = [0.2, 0.08, 0.002]
material = "half_space"

[[geometry]]
type = "cylinder"
start = [0.1, 0.04, 0.0]
end = [0.1, 0.04, 0.002]
radius = 0.01
material = "pec"
"#;

    #[test]
    fn loads_toml_model() {
        let description = ModelDescription::from_toml_str(MODEL).unwrap();
        assert_eq!(description.title, "cylinder in sand");
        assert_eq!(description.cells, Vector3::new(100, 80, 1));
        assert_eq!(description.time_window, TimeWindow::Seconds(3e-9));
        assert_eq!(description.time_step_stability_factor, 1.0);

        assert_eq!(description.pml.thickness.x_min, 15);
        assert_eq!(description.pml.thickness.y_max, 10);
        assert_eq!(description.pml.cfs.sigma.profile, ScalingProfile::Cubic);
        assert_eq!(description.pml.cfs.kappa.min, 1.0);

        assert_eq!(description.materials.len(), 2);
        assert_eq!(description.materials[0].relative_permeability, 1.0);
        assert!(matches!(
            description.materials[1].poles[..],
            [Pole::Debye { delta_er, .. }] if delta_er == 10.0
        ));

        assert_eq!(description.waveforms[0].shape, WaveformShape::Ricker);

        assert_eq!(description.sources.len(), 2);
        assert_eq!(description.sources[0].kind, SourceKind::HertzianDipole);
        assert_eq!(description.sources[0].polarisation, Axis::Z);
        assert_eq!(
            description.sources[1].kind,
            SourceKind::VoltageSource { resistance: 50.0 }
        );
        assert_eq!(
            description.receivers[0].position,
            Point3::new(0.14, 0.07, 0.0)
        );

        assert_eq!(description.geometry.len(), 2);
        assert!(matches!(
            &description.geometry[1],
            GeometryCommand::Cylinder { material, .. } if material == "pec"
        ));
        assert_eq!(description.source_steps, Vector3::zeros());
    }

    #[test]
    fn missing_domain_is_an_error() {
        assert!(ModelDescription::from_toml_str("title = \"x\"").is_err());
    }
}
