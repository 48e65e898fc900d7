use std::{
    collections::HashMap,
    f64::consts::PI,
    fmt::Debug,
};

use num::Complex;
use serde::{
    Deserialize,
    Serialize,
};

use crate::error::Error;

/// Row index into the update coefficient tables.
pub type MaterialId = u32;

#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct PhysicalConstants {
    pub vacuum_permittivity: f64,
    pub vacuum_permeability: f64,
}

impl Debug for PhysicalConstants {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalConstants")
            .field("vacuum_permittivity", &self.vacuum_permittivity)
            .field("vacuum_permeability", &self.vacuum_permeability)
            .field("speed_of_light", &self.speed_of_light())
            .finish()
    }
}

impl Default for PhysicalConstants {
    fn default() -> Self {
        Self::SI
    }
}

impl PhysicalConstants {
    pub const SI: Self = Self {
        vacuum_permittivity: 8.8541878188e-12,
        vacuum_permeability: 1.25663706127e-6,
    };

    pub fn speed_of_light(&self) -> f64 {
        (self.vacuum_permittivity * self.vacuum_permeability).powf(-0.5)
    }

    /// Impedance of free space
    pub fn vacuum_impedance(&self) -> f64 {
        (self.vacuum_permeability / self.vacuum_permittivity).sqrt()
    }
}

/// A single term of a dispersive permittivity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pole {
    Debye {
        delta_er: f64,
        /// relaxation time in seconds
        tau: f64,
    },
    Lorentz {
        delta_er: f64,
        /// resonance frequency in Hz
        frequency: f64,
        damping: f64,
    },
    Drude {
        /// plasma frequency in Hz
        frequency: f64,
        /// inverse relaxation time
        damping: f64,
    },
}

/// Pole values of the recursive-convolution scheme.
///
/// `eqt = exp(q dt)`, `eqt2 = exp(q dt/2)`, `zt = (w/q)(1 - eqt)/dt` and
/// `zt2 = (w/q)(1 - eqt2)`.
#[derive(Clone, Copy, Debug)]
pub struct PoleCoefficients {
    pub eqt: Complex<f64>,
    pub eqt2: Complex<f64>,
    pub zt: Complex<f64>,
    pub zt2: Complex<f64>,
}

impl Pole {
    /// Residue `w` and pole `q`, plus the conductivity this pole adds.
    fn residue_and_pole(&self) -> (Complex<f64>, Complex<f64>, f64) {
        match *self {
            Pole::Debye { delta_er, tau } => {
                (
                    Complex::new(delta_er / tau, 0.0),
                    Complex::new(-1.0 / tau, 0.0),
                    0.0,
                )
            }
            Pole::Lorentz {
                delta_er,
                frequency,
                damping,
            } => {
                let wp2 = (2.0 * PI * frequency).powi(2);
                let root = (wp2 - damping.powi(2)).sqrt();
                (
                    Complex::new(0.0, -wp2 * delta_er / root),
                    Complex::new(-damping, root),
                    0.0,
                )
            }
            Pole::Drude { frequency, damping } => {
                let wp2 = (2.0 * PI * frequency).powi(2);
                (
                    Complex::new(-wp2 / damping, 0.0),
                    Complex::new(-damping, 0.0),
                    wp2 / damping,
                )
            }
        }
    }

    pub fn coefficients(&self, dt: f64) -> PoleCoefficients {
        let (w, q, _) = self.residue_and_pole();
        let eqt = (q * dt).exp();
        let eqt2 = (q * (0.5 * dt)).exp();
        let zt = (w / q) * (1.0 - eqt) / dt;
        let zt2 = (w / q) * (1.0 - eqt2);
        PoleCoefficients {
            eqt,
            eqt2,
            zt,
            zt2,
        }
    }

    /// Contribution to the complex relative permittivity at angular frequency
    /// `omega`.
    fn susceptibility(&self, omega: f64) -> Complex<f64> {
        let i = Complex::<f64>::i();
        match *self {
            Pole::Debye { delta_er, tau } => delta_er / (1.0 + i * omega * tau),
            Pole::Lorentz {
                delta_er,
                frequency,
                damping,
            } => {
                let wp2 = (2.0 * PI * frequency).powi(2);
                delta_er * wp2 / (wp2 + 2.0 * i * omega * damping - omega.powi(2))
            }
            Pole::Drude { frequency, damping } => {
                let wp2 = (2.0 * PI * frequency).powi(2);
                -wp2 / (omega.powi(2) + i * omega * damping)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialKind {
    Builtin,
    #[default]
    User,
    /// Created by the grid builder to average materials sharing an edge.
    Averaged,
    /// Created for the internal resistance of a voltage source.
    VoltageSource,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub name: String,

    /// epsilon_r
    #[serde(default = "default_one")]
    pub relative_permittivity: f64,
    /// sigma
    #[serde(default)]
    pub electric_conductivity: f64,
    /// mu_r
    #[serde(default = "default_one")]
    pub relative_permeability: f64,
    /// sigma_m
    #[serde(default)]
    pub magnetic_conductivity: f64,

    #[serde(default)]
    pub poles: Vec<Pole>,

    #[serde(default = "default_true")]
    pub averagable: bool,

    #[serde(default)]
    pub kind: MaterialKind,
}

fn default_one() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relative_permittivity: 1.0,
            electric_conductivity: 0.0,
            relative_permeability: 1.0,
            magnetic_conductivity: 0.0,
            poles: vec![],
            averagable: true,
            kind: MaterialKind::User,
        }
    }

    pub fn pec() -> Self {
        Self {
            electric_conductivity: f64::INFINITY,
            averagable: false,
            kind: MaterialKind::Builtin,
            ..Self::new("pec")
        }
    }

    pub fn free_space() -> Self {
        Self {
            kind: MaterialKind::Builtin,
            ..Self::new("free_space")
        }
    }

    pub fn is_pec(&self) -> bool {
        self.electric_conductivity == f64::INFINITY
    }

    pub fn is_dispersive(&self) -> bool {
        !self.poles.is_empty()
    }

    /// Electric conductivity including the contribution of Drude poles.
    pub fn effective_electric_conductivity(&self) -> f64 {
        self.electric_conductivity
            + self
                .poles
                .iter()
                .map(|pole| pole.residue_and_pole().2)
                .sum::<f64>()
    }

    /// Complex relative permittivity at `frequency` (Hz).
    pub fn relative_permittivity_at(
        &self,
        frequency: f64,
        physical_constants: &PhysicalConstants,
    ) -> Complex<f64> {
        let omega = 2.0 * PI * frequency;
        let conductivity = Complex::new(
            0.0,
            -self.electric_conductivity / (omega * physical_constants.vacuum_permittivity),
        );
        self.poles.iter().fold(
            Complex::new(self.relative_permittivity, 0.0) + conductivity,
            |er, pole| er + pole.susceptibility(omega),
        )
    }
}

/// All materials of a model, indexed by [`MaterialId`].
///
/// The built-in materials `pec` and `free_space` always occupy IDs 0 and 1.
#[derive(Clone, Debug)]
pub struct Materials {
    materials: Vec<Material>,
    by_name: HashMap<String, MaterialId>,
    /// Averaged materials keyed by their sorted constituents.
    averaged: HashMap<Vec<MaterialId>, MaterialId>,
}

impl Default for Materials {
    fn default() -> Self {
        let mut materials = Self {
            materials: vec![],
            by_name: HashMap::new(),
            averaged: HashMap::new(),
        };
        materials.push(Material::pec());
        materials.push(Material::free_space());
        materials
    }
}

impl Materials {
    pub const PEC: MaterialId = 0;
    pub const FREE_SPACE: MaterialId = 1;

    pub fn push(&mut self, material: Material) -> MaterialId {
        let id = self.materials.len() as MaterialId;
        self.by_name.insert(material.name.clone(), id);
        self.materials.push(material);
        id
    }

    pub fn get(&self, id: MaterialId) -> &Material {
        &self.materials[id as usize]
    }

    pub fn find(&self, name: &str) -> Result<MaterialId, Error> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownMaterial(name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MaterialId, &Material)> {
        self.materials
            .iter()
            .enumerate()
            .map(|(id, material)| (id as MaterialId, material))
    }

    /// Maximum number of poles over all materials.
    pub fn max_poles(&self) -> usize {
        self.materials
            .iter()
            .map(|material| material.poles.len())
            .max()
            .unwrap_or_default()
    }

    pub fn is_averagable(&self, id: MaterialId) -> bool {
        self.get(id).averagable
    }

    /// Returns the material averaging `constituents`, creating it on first
    /// use.
    ///
    /// The name joins the constituents' names with `+` in the order given,
    /// but lookup ignores order.
    pub fn average(&mut self, constituents: &[MaterialId]) -> MaterialId {
        let mut key = constituents.to_vec();
        key.sort_unstable();

        if let Some(id) = self.averaged.get(&key) {
            return *id;
        }

        let n = constituents.len() as f64;
        let mean = |f: fn(&Material) -> f64| {
            constituents
                .iter()
                .map(|id| f(self.get(*id)))
                .sum::<f64>()
                / n
        };

        let name = constituents
            .iter()
            .map(|id| self.get(*id).name.as_str())
            .collect::<Vec<_>>()
            .join("+");

        let material = Material {
            relative_permittivity: mean(|m| m.relative_permittivity),
            electric_conductivity: mean(|m| m.electric_conductivity),
            relative_permeability: mean(|m| m.relative_permeability),
            magnetic_conductivity: mean(|m| m.magnetic_conductivity),
            kind: MaterialKind::Averaged,
            ..Material::new(name)
        };

        tracing::trace!(name = %material.name, "creating averaged material");

        let id = self.push(material);
        self.averaged.insert(key, id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Material,
        Materials,
        PhysicalConstants,
        Pole,
    };

    #[test]
    fn builtins_have_fixed_ids() {
        let materials = Materials::default();
        assert_eq!(materials.find("pec").unwrap(), Materials::PEC);
        assert_eq!(materials.find("free_space").unwrap(), Materials::FREE_SPACE);
        assert!(materials.get(Materials::PEC).is_pec());
        assert!(!materials.is_averagable(Materials::PEC));
        assert_eq!(materials.max_poles(), 0);
    }

    #[test]
    fn averaged_materials_are_reused_regardless_of_order() {
        let mut materials = Materials::default();
        let sand = materials.push(Material {
            relative_permittivity: 3.0,
            electric_conductivity: 0.01,
            ..Material::new("sand")
        });
        let a = materials.average(&[sand, Materials::FREE_SPACE, sand, sand]);
        let b = materials.average(&[Materials::FREE_SPACE, sand, sand, sand]);
        assert_eq!(a, b);
        let averaged = materials.get(a);
        assert_eq!(averaged.name, "sand+free_space+sand+sand");
        assert!((averaged.relative_permittivity - 2.5).abs() < 1e-12);
        assert!((averaged.electric_conductivity - 0.0075).abs() < 1e-12);
    }

    #[test]
    fn debye_permittivity_limits() {
        let material = Material {
            relative_permittivity: 4.0,
            poles: vec![Pole::Debye {
                delta_er: 10.0,
                tau: 1e-9,
            }],
            ..Material::new("water")
        };
        let constants = PhysicalConstants::SI;
        let low = material.relative_permittivity_at(1e3, &constants);
        let high = material.relative_permittivity_at(1e15, &constants);
        assert!((low.re - 14.0).abs() < 1e-3);
        assert!((high.re - 4.0).abs() < 1e-3);
    }

    #[test]
    fn debye_pole_coefficients() {
        let dt = 1e-12;
        let tau = 1e-9;
        let pole = Pole::Debye { delta_er: 2.0, tau };
        let coefficients = pole.coefficients(dt);
        let expected_eqt = (-dt / tau).exp();
        assert!((coefficients.eqt.re - expected_eqt).abs() < 1e-12);
        assert_eq!(coefficients.eqt.im, 0.0);
        // (w/q)(1 - eqt)/dt with w/q = -delta_er
        let expected_zt = -2.0 * (1.0 - expected_eqt) / dt;
        assert!((coefficients.zt.re - expected_zt).abs() / expected_zt.abs() < 1e-9);
    }

    #[test]
    fn drude_adds_conductivity() {
        let material = Material {
            electric_conductivity: 1.0,
            poles: vec![Pole::Drude {
                frequency: 1e9,
                damping: 1e10,
            }],
            ..Material::new("metal")
        };
        let wp2 = (2.0 * std::f64::consts::PI * 1e9f64).powi(2);
        assert!(
            (material.effective_electric_conductivity() - (1.0 + wp2 / 1e10)).abs() < 1e-6
        );
    }
}
