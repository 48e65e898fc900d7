//! Host-side layout of everything uploaded to the device.

use bytemuck::{
    Pod,
    Zeroable,
};

use crate::{
    Real,
    coefficients::{
        CURL,
        LOSS,
        SOURCE,
        UpdateCoefficients,
    },
    error::Error,
    grid::{
        FieldComponent,
        Grid,
    },
    source::Source,
};

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct ParamsData {
    pub iteration: u32,
    pub iterations: u32,
    pub num_electric_sources: u32,
    pub num_magnetic_sources: u32,
    pub num_receivers: u32,
    _padding: [u32; 3],
}

impl ParamsData {
    pub fn new(grid: &Grid, sources: &SourceTable) -> Self {
        Self {
            iterations: grid.iterations() as u32,
            num_electric_sources: sources.num_electric as u32,
            num_magnetic_sources: sources.num_magnetic as u32,
            num_receivers: grid.receivers().len() as u32,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct MaterialRowData {
    loss_curl: [f32; 4],
    source: [f32; 4],
}

impl MaterialRowData {
    fn from_row(row: &[Real]) -> Self {
        Self {
            loss_curl: [row[LOSS], row[CURL[0]], row[CURL[1]], row[CURL[2]]],
            source: [row[SOURCE], 0.0, 0.0, 0.0],
        }
    }
}

/// Electric rows followed by magnetic rows.
pub fn coefficient_rows(coefficients: &UpdateCoefficients) -> Vec<MaterialRowData> {
    let num_materials = coefficients.num_materials();
    [&coefficients.electric, &coefficients.magnetic]
        .into_iter()
        .flat_map(|table| {
            (0..num_materials).map(|id| MaterialRowData::from_row(table.row(id as u32)))
        })
        .collect()
}

/// Dispersive coefficients as `vec2<f32>`, or nothing.
pub fn dispersive_coefficients(coefficients: &UpdateCoefficients) -> Vec<[f32; 2]> {
    coefficients
        .dispersive
        .iter()
        .flat_map(|table| table.as_slice().iter().map(|c| [c.re, c.im]))
        .collect()
}

/// Accumulators in `(axis * num_nodes + node) * poles + pole` order.
pub fn accumulators(grid: &Grid) -> Vec<[f32; 2]> {
    grid.dispersive_state()
        .iter()
        .flat_map(|state| [&state.tx, &state.ty, &state.tz])
        .flat_map(|t| t.iter().map(|c| [c.re, c.im]))
        .collect()
}

/// All six components, one after the other.
pub fn fields(grid: &Grid) -> Vec<f32> {
    let fields = grid.fields();
    <FieldComponent as strum::VariantArray>::VARIANTS
        .iter()
        .flat_map(|component| fields.component(*component).as_slice())
        .copied()
        .collect()
}

pub const HERTZIAN_DIPOLE: u32 = 0;
pub const VOLTAGE_SOURCE: u32 = 1;
pub const HARD_VOLTAGE_SOURCE: u32 = 2;
pub const MAGNETIC_DIPOLE: u32 = 3;

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SourceData {
    pub index: u32,
    pub component: u32,
    pub kind: u32,
    pub waveform: u32,
    pub first: u32,
    pub last: u32,
    pub factor: f32,
    _padding: u32,
}

/// Sources in application order: voltage sources, hertzian dipoles, then
/// magnetic dipoles.
#[derive(Clone, Debug, Default)]
pub struct SourceTable {
    pub sources: Vec<SourceData>,
    /// One sample per iteration and source.
    pub waveforms: Vec<f32>,
    pub num_electric: usize,
    pub num_magnetic: usize,
}

impl SourceTable {
    pub fn new(grid: &Grid, backend: &'static str) -> Result<Self, Error> {
        let sources = grid.sources();
        if !sources.transmission_lines.is_empty() {
            return Err(Error::UnsupportedOnBackend {
                feature: "transmission lines",
                backend,
            });
        }

        let spacing = grid.spacing();
        let volume = spacing.product();
        let mut table = Self::default();

        for voltage_source in &sources.voltage_sources {
            let d = spacing[voltage_source.source.polarisation.index()];
            let (kind, factor) = if voltage_source.resistance != 0.0 {
                (
                    VOLTAGE_SOURCE,
                    1.0 / (voltage_source.resistance * volume / d),
                )
            }
            else {
                (HARD_VOLTAGE_SOURCE, 1.0 / d)
            };
            table.push(grid, &voltage_source.source, kind, factor, true);
        }
        for source in &sources.hertzian_dipoles {
            let d = spacing[source.polarisation.index()];
            table.push(grid, source, HERTZIAN_DIPOLE, d / volume, true);
        }
        table.num_electric = table.sources.len();

        for source in &sources.magnetic_dipoles {
            table.push(grid, source, MAGNETIC_DIPOLE, 1.0 / volume, false);
        }
        table.num_magnetic = table.sources.len() - table.num_electric;

        Ok(table)
    }

    fn push(&mut self, grid: &Grid, source: &Source, kind: u32, factor: f64, electric: bool) {
        let iterations = grid.iterations();
        let component = if electric {
            FieldComponent::electric(source.polarisation)
        }
        else {
            FieldComponent::magnetic(source.polarisation)
        };

        let mut active = (0..iterations).filter(|iteration| source.is_active(*iteration, grid.dt()));
        let (first, last) = match active.next() {
            Some(first) => (first as u32, active.last().unwrap_or(first) as u32),
            None => (u32::MAX, 0),
        };

        let waveform = if electric {
            &source.waveform_j
        }
        else {
            &source.waveform_m
        };

        self.sources.push(SourceData {
            index: grid.ids().strider().index_unchecked(&source.position) as u32,
            component: component.index() as u32,
            kind,
            waveform: self.waveforms.len() as u32,
            first,
            last,
            factor: factor as f32,
            _padding: 0,
        });
        self.waveforms.extend(
            (0..iterations).map(|iteration| waveform.get(iteration).copied().unwrap_or_default()),
        );
    }
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct PmlParamsData {
    start: [u32; 4],
    end: [u32; 4],
    phi_size: [u32; 4],
    component: u32,
    derivative_of: u32,
    normal: u32,
    electric: u32,
    is_max: u32,
    thickness: u32,
    cells_along_normal: u32,
    profile: u32,
    sign: f32,
    inverse_spacing: f32,
    _padding: [u32; 2],
}

/// One dispatch of the PML kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmlCorrectionRef {
    /// Index into [`PmlTable::params`].
    pub params: usize,
    /// Number of nodes corrected.
    pub work: usize,
}

/// All corrections of all regions, with their profiles and auxiliary arrays
/// concatenated.
#[derive(Clone, Debug, Default)]
pub struct PmlTable {
    pub params: Vec<PmlParamsData>,
    pub profiles: Vec<f32>,
    pub phi: Vec<f32>,
    pub electric: Vec<PmlCorrectionRef>,
    pub magnetic: Vec<PmlCorrectionRef>,
}

impl PmlTable {
    pub fn new(grid: &Grid) -> Self {
        let mut table = Self::default();

        for region in grid.pmls() {
            let shape = region.shape();
            for (electric, profile, corrections) in [
                (
                    true,
                    region.electric_profile(),
                    region.electric_corrections(),
                ),
                (
                    false,
                    region.magnetic_profile(),
                    region.magnetic_corrections(),
                ),
            ] {
                let profile_offset = table.profiles.len() as u32;
                for values in [&profile.ra, &profile.rb, &profile.re, &profile.rf] {
                    table.profiles.extend_from_slice(values);
                }

                for correction in corrections {
                    let phi_offset = table.phi.len() as u32;
                    table.phi.extend_from_slice(correction.phi.as_slice());

                    let range = &correction.range;
                    let work = (range.end - range.start).product();
                    let phi_size = correction.phi.size().cast::<u32>();

                    let params = PmlParamsData {
                        start: [
                            range.start.x as u32,
                            range.start.y as u32,
                            range.start.z as u32,
                            0,
                        ],
                        end: [
                            range.end.x as u32,
                            range.end.y as u32,
                            range.end.z as u32,
                            0,
                        ],
                        phi_size: [phi_size.x, phi_size.y, phi_size.z, phi_offset],
                        component: correction.component.index() as u32,
                        derivative_of: correction.derivative_of.index() as u32,
                        normal: shape.face.axis().index() as u32,
                        electric: electric as u32,
                        is_max: shape.face.is_max() as u32,
                        thickness: shape.thickness as u32,
                        cells_along_normal: shape.cells_along_normal as u32,
                        profile: profile_offset,
                        sign: correction.sign,
                        inverse_spacing: region.inverse_spacing(),
                        _padding: [0; 2],
                    };

                    let correction = PmlCorrectionRef {
                        params: table.params.len(),
                        work,
                    };
                    table.params.push(params);
                    if electric {
                        table.electric.push(correction);
                    }
                    else {
                        table.magnetic.push(correction);
                    }
                }
            }
        }

        table
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Point3;

    use super::{
        HERTZIAN_DIPOLE,
        MaterialRowData,
        PmlParamsData,
        PmlTable,
        SourceTable,
        VOLTAGE_SOURCE,
        coefficient_rows,
    };
    use crate::{
        error::Error,
        grid::Axis,
        model::tests::prepared_grid,
        pml::PmlDescription,
        solver::cpu::tests::dipole_model,
        source::{
            SourceDescription,
            SourceKind,
        },
    };

    #[test]
    fn uniform_layouts_match_wgsl() {
        assert_eq!(size_of::<MaterialRowData>(), 32);
        assert_eq!(size_of::<PmlParamsData>(), 96);
    }

    #[test]
    fn electric_rows_come_first() {
        let grid = prepared_grid(&dipole_model(10, 10));
        let coefficients = grid.coefficients().unwrap();
        let rows = coefficient_rows(coefficients);
        assert_eq!(rows.len(), 2 * coefficients.num_materials());
        // pec has no electric update, but a magnetic one
        assert_eq!(rows[0].loss_curl, [0.0; 4]);
        assert_ne!(rows[coefficients.num_materials()].loss_curl[0], 0.0);
    }

    #[test]
    fn voltage_sources_precede_dipoles() {
        let mut description = dipole_model(10, 10);
        description.sources.push(SourceDescription {
            id: None,
            kind: SourceKind::VoltageSource { resistance: 50.0 },
            polarisation: Axis::Z,
            position: Point3::new(0.002, 0.005, 0.005),
            waveform: "pulse".to_owned(),
            start: 0.0,
            stop: None,
        });
        let grid = prepared_grid(&description);

        let table = SourceTable::new(&grid, "wgpu").unwrap();
        assert_eq!(table.num_electric, 2);
        assert_eq!(table.num_magnetic, 0);
        assert_eq!(table.sources[0].kind, VOLTAGE_SOURCE);
        assert_eq!(table.sources[1].kind, HERTZIAN_DIPOLE);
        assert_eq!(table.sources[1].waveform, 10);
        assert_eq!(table.waveforms.len(), 20);
        assert_eq!((table.sources[0].first, table.sources[0].last), (0, 9));
    }

    #[test]
    fn transmission_lines_are_rejected() {
        let mut description = dipole_model(20, 10);
        description.sources.push(SourceDescription {
            id: None,
            kind: SourceKind::TransmissionLine { resistance: 50.0 },
            polarisation: Axis::Z,
            position: Point3::new(0.005, 0.01, 0.01),
            waveform: "pulse".to_owned(),
            start: 0.0,
            stop: None,
        });
        let grid = prepared_grid(&description);
        assert!(matches!(
            SourceTable::new(&grid, "wgpu"),
            Err(Error::UnsupportedOnBackend {
                feature: "transmission lines",
                backend: "wgpu"
            })
        ));
    }

    #[test]
    fn pml_table_has_two_corrections_per_field_and_region() {
        let mut description = dipole_model(20, 10);
        description.pml = PmlDescription::default();
        description.pml.thickness = crate::pml::PmlThickness::uniform(4);
        let grid = prepared_grid(&description);
        let table = PmlTable::new(&grid);

        assert_eq!(grid.pmls().len(), 6);
        assert_eq!(table.electric.len(), 12);
        assert_eq!(table.magnetic.len(), 12);
        assert_eq!(table.profiles.len(), 6 * 2 * 4 * 4);
        let phi = grid
            .pmls()
            .iter()
            .flat_map(|pml| {
                pml.electric_corrections()
                    .iter()
                    .chain(pml.magnetic_corrections())
            })
            .map(|correction| correction.phi.len())
            .sum::<usize>();
        assert_eq!(table.phi.len(), phi);
        assert!(table.electric.iter().all(|correction| correction.work > 0));
    }
}
