//! Update coefficient tables.
//!
//! Every field component location carries a [`MaterialId`] in the edge ID
//! array, which selects a row in these tables.

use nalgebra::Vector3;

use crate::{
    Complex,
    Real,
    material::{
        MaterialId,
        Materials,
        PhysicalConstants,
    },
};

/// Column holding `CA` (electric) or `DA` (magnetic).
pub const LOSS: usize = 0;
/// Columns holding the curl coefficients for derivatives along x, y, z.
pub const CURL: [usize; 3] = [1, 2, 3];
/// Column holding `srce` (electric) or `srcm` (magnetic).
pub const SOURCE: usize = 4;

pub const NUM_COLUMNS: usize = 5;

/// Dense row-major table.
#[derive(Clone, Debug, PartialEq)]
pub struct CoefficientTable<T> {
    columns: usize,
    data: Vec<T>,
}

impl<T> CoefficientTable<T>
where
    T: Copy,
{
    fn from_rows(columns: usize, rows: impl IntoIterator<Item = Vec<T>>) -> Self {
        let data = rows
            .into_iter()
            .flat_map(|row| {
                assert_eq!(row.len(), columns);
                row
            })
            .collect();
        Self { columns, data }
    }

    #[inline(always)]
    pub fn row(&self, id: MaterialId) -> &[T] {
        let start = id as usize * self.columns;
        &self.data[start..start + self.columns]
    }

    pub fn rows(&self) -> usize {
        self.data.len().checked_div(self.columns).unwrap_or_default()
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.len() * size_of::<T>()
    }
}

/// Which electric update kernel is used for the whole run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElectricUpdate {
    /// No dispersive materials.
    Standard,
    /// At most one pole per material.
    SinglePole,
    /// Sum over `poles` accumulators per field component.
    MultiPole { poles: usize },
}

impl ElectricUpdate {
    pub fn for_max_poles(max_poles: usize) -> Self {
        match max_poles {
            0 => Self::Standard,
            1 => Self::SinglePole,
            poles => Self::MultiPole { poles },
        }
    }

    pub fn poles(&self) -> usize {
        match self {
            Self::Standard => 0,
            Self::SinglePole => 1,
            Self::MultiPole { poles } => *poles,
        }
    }
}

/// Per-material coefficients for the electric and magnetic leapfrog updates.
///
/// Electric rows are `[CA, CBx, CBy, CBz, srce]`, magnetic rows are
/// `[DA, DBx, DBy, DBz, srcm]`. If any material is dispersive, the dispersive
/// table holds `[e0*eqt2, eqt, zt]` for each pole.
#[derive(Clone, Debug)]
pub struct UpdateCoefficients {
    pub electric: CoefficientTable<Real>,
    pub magnetic: CoefficientTable<Real>,
    pub dispersive: Option<CoefficientTable<Complex>>,
    pub max_poles: usize,
}

impl UpdateCoefficients {
    pub fn new(
        materials: &Materials,
        spacing: &Vector3<f64>,
        dt: f64,
        physical_constants: &PhysicalConstants,
    ) -> Self {
        let e0 = physical_constants.vacuum_permittivity;
        let m0 = physical_constants.vacuum_permeability;
        let max_poles = materials.max_poles();

        let magnetic = CoefficientTable::from_rows(
            NUM_COLUMNS,
            materials.iter().map(|(_, material)| {
                let ha = m0 * material.relative_permeability / dt
                    + 0.5 * material.magnetic_conductivity;
                let hb = m0 * material.relative_permeability / dt
                    - 0.5 * material.magnetic_conductivity;
                curl_row(hb / ha, ha, spacing)
            }),
        );

        let electric = CoefficientTable::from_rows(
            NUM_COLUMNS,
            materials.iter().map(|(_, material)| {
                if material.is_pec() {
                    return vec![0.0; NUM_COLUMNS];
                }

                let se = material.effective_electric_conductivity();
                let dispersive_sum = material
                    .poles
                    .iter()
                    .map(|pole| pole.coefficients(dt).zt2.re)
                    .sum::<f64>();
                let base = e0 * material.relative_permittivity / dt - e0 / dt * dispersive_sum;
                let ea = base + 0.5 * se;
                let eb = base - 0.5 * se;
                curl_row(eb / ea, ea, spacing)
            }),
        );

        let dispersive = (max_poles > 0).then(|| {
            CoefficientTable::from_rows(
                3 * max_poles,
                materials.iter().map(|(_, material)| {
                    let mut row = vec![Complex::default(); 3 * max_poles];
                    for (pole, chunk) in material.poles.iter().zip(row.chunks_exact_mut(3)) {
                        let coefficients = pole.coefficients(dt);
                        let cast = |c: num::Complex<f64>| Complex::new(c.re as Real, c.im as Real);
                        chunk[0] = cast(coefficients.eqt2 * e0);
                        chunk[1] = cast(coefficients.eqt);
                        chunk[2] = cast(coefficients.zt);
                    }
                    row
                }),
            )
        });

        tracing::debug!(
            num_materials = materials.len(),
            max_poles,
            "computed update coefficients"
        );

        Self {
            electric,
            magnetic,
            dispersive,
            max_poles,
        }
    }

    pub fn electric_update(&self) -> ElectricUpdate {
        ElectricUpdate::for_max_poles(self.max_poles)
    }

    pub fn num_materials(&self) -> usize {
        self.electric.rows()
    }

    /// Bytes needed for the electric and magnetic tables.
    pub fn size_in_bytes(&self) -> usize {
        self.electric.size_in_bytes()
            + self.magnetic.size_in_bytes()
            + self
                .dispersive
                .as_ref()
                .map_or(0, |dispersive| dispersive.size_in_bytes())
    }
}

fn curl_row(loss: f64, a: f64, spacing: &Vector3<f64>) -> Vec<Real> {
    vec![
        loss as Real,
        (1.0 / spacing.x / a) as Real,
        (1.0 / spacing.y / a) as Real,
        (1.0 / spacing.z / a) as Real,
        (1.0 / a) as Real,
    ]
}
