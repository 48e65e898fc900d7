//! The simulation context.
//!
//! A [`Grid`] owns everything a model run mutates: geometry arrays, the edge
//! ID array, field arrays, coefficient tables, PML regions, sources and
//! receivers. It is passed explicitly to the builder and the solvers.

pub mod build;
pub mod geometry;

use std::ops::Range;

use arrayvec::ArrayVec;
use nalgebra::{
    Point3,
    Vector3,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    Complex,
    Real,
    admission::{
        self,
        DeviceInfo,
        HostInfo,
        MemoryEstimate,
    },
    coefficients::UpdateCoefficients,
    config::{
        ModelDescription,
        TimeWindow,
    },
    dispersion,
    error::Error,
    grid::geometry::{
        RigidE,
        RigidH,
    },
    lattice::Lattice,
    material::{
        MaterialId,
        Materials,
        PhysicalConstants,
    },
    pml::PmlRegion,
    receiver::Receiver,
    source::Sources,
    waveform::Waveform,
};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::VariantArray,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(&self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index % 3 {
            0 => Axis::X,
            1 => Axis::Y,
            _ => Axis::Z,
        }
    }

    /// The two other axes, in ascending order.
    pub fn transverse(&self) -> [Axis; 2] {
        match self {
            Axis::X => [Axis::Y, Axis::Z],
            Axis::Y => [Axis::X, Axis::Z],
            Axis::Z => [Axis::X, Axis::Y],
        }
    }

    pub fn unit(&self) -> Vector3<usize> {
        let mut unit = Vector3::zeros();
        unit[self.index()] = 1;
        unit
    }
}

/// The six field components, in the order of the first dimension of the edge
/// ID array.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::VariantArray,
)]
pub enum FieldComponent {
    Ex,
    Ey,
    Ez,
    Hx,
    Hy,
    Hz,
}

impl FieldComponent {
    pub const fn index(&self) -> usize {
        *self as usize
    }

    pub fn electric(axis: Axis) -> Self {
        match axis {
            Axis::X => Self::Ex,
            Axis::Y => Self::Ey,
            Axis::Z => Self::Ez,
        }
    }

    pub fn magnetic(axis: Axis) -> Self {
        match axis {
            Axis::X => Self::Hx,
            Axis::Y => Self::Hy,
            Axis::Z => Self::Hz,
        }
    }

    pub fn axis(&self) -> Axis {
        Axis::from_index(self.index())
    }

    pub fn is_electric(&self) -> bool {
        self.index() < 3
    }

    /// Node range over which the main leapfrog update writes this component.
    ///
    /// Electric components are updated everywhere except on the domain
    /// boundary faces they are tangential to, magnetic components everywhere
    /// except on the faces they are normal to.
    pub fn update_range(&self, cells: &Vector3<usize>) -> Range<Point3<usize>> {
        let axis = self.axis().index();
        let mut start = Point3::origin();
        let mut end = Point3::from(*cells);
        if self.is_electric() {
            for other in self.axis().transverse() {
                start[other.index()] = 1;
            }
        }
        else {
            start[axis] = 1;
        }
        // an empty range along any axis makes the whole range empty
        for i in 0..3 {
            end[i] = end[i].max(start[i]);
        }
        start..end
    }
}

/// Whether the model is 3D or a single-cell slice of a 3D grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    ThreeD,
    /// nx == 1
    TwoDTMx,
    /// ny == 1
    TwoDTMy,
    /// nz == 1
    TwoDTMz,
}

impl Mode {
    pub fn for_cells(cells: &Vector3<usize>) -> Self {
        if cells.x == 1 {
            Self::TwoDTMx
        }
        else if cells.y == 1 {
            Self::TwoDTMy
        }
        else if cells.z == 1 {
            Self::TwoDTMz
        }
        else {
            Self::ThreeD
        }
    }

    /// The invariant axis of a 2D mode.
    pub fn invariant_axis(&self) -> Option<Axis> {
        match self {
            Self::ThreeD => None,
            Self::TwoDTMx => Some(Axis::X),
            Self::TwoDTMy => Some(Axis::Y),
            Self::TwoDTMz => Some(Axis::Z),
        }
    }
}

/// The six field arrays on the node lattice `(nx+1, ny+1, nz+1)`.
#[derive(Clone, Debug)]
pub struct FieldArrays {
    pub ex: Lattice<Real>,
    pub ey: Lattice<Real>,
    pub ez: Lattice<Real>,
    pub hx: Lattice<Real>,
    pub hy: Lattice<Real>,
    pub hz: Lattice<Real>,
}

impl FieldArrays {
    pub fn new(nodes: &Vector3<usize>) -> Self {
        let zeros = Lattice::from_value(nodes, 0.0);
        Self {
            ex: zeros.clone(),
            ey: zeros.clone(),
            ez: zeros.clone(),
            hx: zeros.clone(),
            hy: zeros.clone(),
            hz: zeros,
        }
    }

    pub fn component(&self, component: FieldComponent) -> &Lattice<Real> {
        match component {
            FieldComponent::Ex => &self.ex,
            FieldComponent::Ey => &self.ey,
            FieldComponent::Ez => &self.ez,
            FieldComponent::Hx => &self.hx,
            FieldComponent::Hy => &self.hy,
            FieldComponent::Hz => &self.hz,
        }
    }

    pub fn component_mut(&mut self, component: FieldComponent) -> &mut Lattice<Real> {
        match component {
            FieldComponent::Ex => &mut self.ex,
            FieldComponent::Ey => &mut self.ey,
            FieldComponent::Ez => &mut self.ez,
            FieldComponent::Hx => &mut self.hx,
            FieldComponent::Hy => &mut self.hy,
            FieldComponent::Hz => &mut self.hz,
        }
    }

    /// All six components at one node, in [`FieldComponent`] order.
    pub fn sample(&self, index: usize) -> [Real; 6] {
        [
            self.ex[index],
            self.ey[index],
            self.ez[index],
            self.hx[index],
            self.hy[index],
            self.hz[index],
        ]
    }

    pub fn zero(&mut self) {
        for lattice in [
            &mut self.ex,
            &mut self.ey,
            &mut self.ez,
            &mut self.hx,
            &mut self.hy,
            &mut self.hz,
        ] {
            lattice.fill(0.0);
        }
    }

    pub fn is_zero(&self) -> bool {
        [&self.ex, &self.ey, &self.ez, &self.hx, &self.hy, &self.hz]
            .iter()
            .all(|lattice| lattice.as_slice().iter().all(|value| *value == 0.0))
    }
}

/// Per-pole accumulators of the dispersive update.
///
/// Written by phase A and finalized by phase B of the same iteration. Entries
/// are laid out `node * poles + pole`, so a z-slab of nodes maps to a
/// contiguous slab of accumulators.
#[derive(Clone, derive_more::Debug)]
pub struct DispersiveState {
    pub poles: usize,
    #[debug(skip)]
    pub tx: Box<[Complex]>,
    #[debug(skip)]
    pub ty: Box<[Complex]>,
    #[debug(skip)]
    pub tz: Box<[Complex]>,
}

impl DispersiveState {
    pub fn new(num_nodes: usize, poles: usize) -> Self {
        let zeros = vec![Complex::default(); num_nodes * poles].into_boxed_slice();
        Self {
            poles,
            tx: zeros.clone(),
            ty: zeros.clone(),
            tz: zeros,
        }
    }

    pub fn zero(&mut self) {
        for t in [&mut self.tx, &mut self.ty, &mut self.tz] {
            t.fill(Complex::default());
        }
    }
}

#[derive(Clone, derive_more::Debug)]
pub struct Grid {
    pub(crate) title: String,
    pub(crate) input_file: Option<String>,
    pub(crate) cells: Vector3<usize>,
    pub(crate) spacing: Vector3<f64>,
    pub(crate) dt: f64,
    pub(crate) iterations: usize,
    pub(crate) mode: Mode,
    pub(crate) physical_constants: PhysicalConstants,

    pub(crate) materials: Materials,
    pub(crate) waveforms: Vec<Waveform>,

    /// Material of each cell, `(nx, ny, nz)`.
    #[debug(skip)]
    pub(crate) solid: Lattice<MaterialId>,
    #[debug(skip)]
    pub(crate) rigid_e: Lattice<RigidE>,
    #[debug(skip)]
    pub(crate) rigid_h: Lattice<RigidH>,

    /// Material of each field component location, `(nx+1, ny+1, nz+1)`.
    #[debug(skip)]
    pub(crate) ids: Lattice<[MaterialId; 6]>,

    #[debug(skip)]
    pub(crate) fields: FieldArrays,
    pub(crate) coefficients: Option<UpdateCoefficients>,
    pub(crate) dispersive: Option<DispersiveState>,

    pub(crate) pmls: ArrayVec<PmlRegion, 6>,
    pub(crate) sources: Sources,
    pub(crate) receivers: Vec<Receiver>,

    /// Per-run step of simple sources, in cells.
    pub(crate) source_steps: Vector3<i64>,
    /// Per-run step of receivers, in cells.
    pub(crate) receiver_steps: Vector3<i64>,
}

impl Grid {
    /// Creates the grid with all geometry arrays initialized to free space and
    /// all fields zero. Sources and receivers are wired, but nothing is
    /// painted yet.
    pub fn new(
        description: &ModelDescription,
        physical_constants: PhysicalConstants,
    ) -> Result<Self, Error> {
        let spacing = description.spacing;
        if spacing.iter().any(|d| !(*d > 0.0)) {
            return Err(Error::InvalidConfig(format!(
                "spatial step must be positive: {spacing:?}"
            )));
        }

        let cells = description.cells;
        if cells.iter().any(|n| *n == 0) {
            return Err(Error::InvalidConfig(format!(
                "domain must be at least one cell along every axis: {cells:?}"
            )));
        }

        let mode = Mode::for_cells(&cells);

        let stability_factor = description.time_step_stability_factor;
        if !(stability_factor > 0.0 && stability_factor <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "time step stability factor must be in (0, 1]: {stability_factor}"
            )));
        }
        let dt = courant_time_step(&spacing, mode, &physical_constants) * stability_factor;

        let iterations = match description.time_window {
            TimeWindow::Iterations(iterations) => iterations,
            TimeWindow::Seconds(seconds) => (seconds / dt).ceil() as usize + 1,
        };

        let mut materials = Materials::default();
        for material in &description.materials {
            if materials.find(&material.name).is_ok() {
                return Err(Error::InvalidConfig(format!(
                    "material '{}' defined more than once",
                    material.name
                )));
            }
            materials.push(material.clone());
        }

        let nodes = cells.add_scalar(1);

        let mut grid = Self {
            title: description.title.clone(),
            input_file: description.input_file.clone(),
            cells,
            spacing,
            dt,
            iterations,
            mode,
            physical_constants,
            materials,
            waveforms: description.waveforms.clone(),
            solid: Lattice::from_value(&cells, Materials::FREE_SPACE),
            rigid_e: Lattice::from_value(&cells, RigidE::empty()),
            rigid_h: Lattice::from_value(&cells, RigidH::empty()),
            ids: Lattice::from_value(&nodes, [Materials::FREE_SPACE; 6]),
            fields: FieldArrays::new(&nodes),
            coefficients: None,
            dispersive: None,
            pmls: ArrayVec::new(),
            sources: Sources::default(),
            receivers: vec![],
            source_steps: steps_in_cells(&description.source_steps, &spacing),
            receiver_steps: steps_in_cells(&description.receiver_steps, &spacing),
        };

        grid.sources = Sources::new(&grid, &description.sources)?;
        grid.receivers = description
            .receivers
            .iter()
            .enumerate()
            .map(|(index, receiver)| Receiver::new(&grid, index, receiver))
            .collect::<Result<_, _>>()?;

        tracing::debug!(
            ?cells,
            ?spacing,
            dt,
            iterations,
            ?mode,
            num_materials = grid.materials.len(),
            "created grid"
        );

        Ok(grid)
    }

    /// Runs the admission check, allocates dispersive state and computes the
    /// update coefficients.
    ///
    /// Nothing large is allocated if the admission check fails. Also checks
    /// for non-physical wave propagation.
    pub fn prepare(&mut self, host: &HostInfo, device: Option<&DeviceInfo>) -> Result<(), Error> {
        let estimate = MemoryEstimate::for_grid(self);
        tracing::debug!(estimate = %estimate, "estimated memory");
        admission::admit(&estimate, host, device)?;

        let coefficients = UpdateCoefficients::new(
            &self.materials,
            &self.spacing,
            self.dt,
            &self.physical_constants,
        );

        if let Some(device) = device {
            admission::check_constant_memory(&coefficients, device)?;
        }

        self.dispersive = (coefficients.max_poles > 0)
            .then(|| DispersiveState::new(self.num_nodes(), coefficients.max_poles));
        self.coefficients = Some(coefficients);

        dispersion::check(self)?;

        Ok(())
    }

    /// Zeroes fields, PML auxiliary arrays and dispersive accumulators, so the
    /// grid can be reused for another run without rebuilding.
    pub fn reset(&mut self) {
        self.fields.zero();
        for pml in &mut self.pmls {
            pml.reset();
        }
        if let Some(dispersive) = &mut self.dispersive {
            dispersive.zero();
        }
        self.sources.reset();
        for receiver in &mut self.receivers {
            receiver.reset();
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn cells(&self) -> &Vector3<usize> {
        &self.cells
    }

    pub fn nodes(&self) -> Vector3<usize> {
        self.cells.add_scalar(1)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().product()
    }

    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn physical_constants(&self) -> &PhysicalConstants {
        &self.physical_constants
    }

    pub fn materials(&self) -> &Materials {
        &self.materials
    }

    pub fn waveforms(&self) -> &[Waveform] {
        &self.waveforms
    }

    pub fn ids(&self) -> &Lattice<[MaterialId; 6]> {
        &self.ids
    }

    /// Material at a field component location.
    pub fn id(&self, component: FieldComponent, point: &Point3<usize>) -> Option<MaterialId> {
        self.ids.get(point).map(|ids| ids[component.index()])
    }

    pub fn solid(&self) -> &Lattice<MaterialId> {
        &self.solid
    }

    pub fn fields(&self) -> &FieldArrays {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut FieldArrays {
        &mut self.fields
    }

    pub fn coefficients(&self) -> Option<&UpdateCoefficients> {
        self.coefficients.as_ref()
    }

    pub fn dispersive_state(&self) -> Option<&DispersiveState> {
        self.dispersive.as_ref()
    }

    pub fn pmls(&self) -> &[PmlRegion] {
        &self.pmls
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    pub fn receivers(&self) -> &[Receiver] {
        &self.receivers
    }

    pub(crate) fn coefficients_or_err(&self) -> Result<&UpdateCoefficients, Error> {
        self.coefficients.as_ref().ok_or(Error::NotPrepared)
    }
}

/// Largest stable time step for the grid, ignoring the invariant axis of 2D
/// modes.
pub fn courant_time_step(
    spacing: &Vector3<f64>,
    mode: Mode,
    physical_constants: &PhysicalConstants,
) -> f64 {
    let invariant = mode.invariant_axis().map(|axis| axis.index());
    let sum = (0..3)
        .filter(|axis| Some(*axis) != invariant)
        .map(|axis| spacing[axis].powi(-2))
        .sum::<f64>();
    1.0 / (physical_constants.speed_of_light() * sum.sqrt())
}

fn steps_in_cells(steps: &Vector3<f64>, spacing: &Vector3<f64>) -> Vector3<i64> {
    steps.zip_map(spacing, |step, d| (step / d).round() as i64)
}

#[cfg(test)]
pub(crate) mod tests {
    use nalgebra::{
        Point3,
        Vector3,
    };

    use super::{
        Axis,
        FieldComponent,
        Grid,
        Mode,
        courant_time_step,
    };
    use crate::{
        config::{
            ModelDescription,
            TimeWindow,
        },
        material::PhysicalConstants,
    };

    /// A small free-space model without PML, sources or receivers.
    pub fn empty_model(cells: [usize; 3], iterations: usize) -> ModelDescription {
        ModelDescription {
            cells: Vector3::from(cells),
            spacing: Vector3::repeat(1e-3),
            time_window: TimeWindow::Iterations(iterations),
            pml: crate::pml::PmlDescription::off(),
            ..Default::default()
        }
    }

    #[test]
    fn update_ranges_exclude_boundaries() {
        let cells = Vector3::new(4, 5, 6);
        let ex = FieldComponent::Ex.update_range(&cells);
        assert_eq!(ex.start, Point3::new(0, 1, 1));
        assert_eq!(ex.end, Point3::new(4, 5, 6));
        let hy = FieldComponent::Hy.update_range(&cells);
        assert_eq!(hy.start, Point3::new(0, 1, 0));
        assert_eq!(hy.end, Point3::new(4, 5, 6));
    }

    #[test]
    fn two_d_modes() {
        assert_eq!(Mode::for_cells(&Vector3::new(1, 10, 10)), Mode::TwoDTMx);
        assert_eq!(Mode::for_cells(&Vector3::new(10, 10, 1)), Mode::TwoDTMz);
        assert_eq!(Mode::for_cells(&Vector3::new(10, 10, 10)), Mode::ThreeD);
        assert_eq!(Mode::TwoDTMy.invariant_axis(), Some(Axis::Y));
    }

    #[test]
    fn time_step_is_courant_limit() {
        let constants = PhysicalConstants::SI;
        let spacing = Vector3::repeat(1e-3);
        let dt = courant_time_step(&spacing, Mode::ThreeD, &constants);
        let expected = 1e-3 / (constants.speed_of_light() * 3f64.sqrt());
        assert!((dt - expected).abs() / expected < 1e-12);

        let dt_2d = courant_time_step(&spacing, Mode::TwoDTMz, &constants);
        let expected_2d = 1e-3 / (constants.speed_of_light() * 2f64.sqrt());
        assert!((dt_2d - expected_2d).abs() / expected_2d < 1e-12);
    }

    #[test]
    fn iterations_from_time_window() {
        let mut description = empty_model([10, 10, 10], 0);
        let constants = PhysicalConstants::SI;
        let dt = courant_time_step(&description.spacing, Mode::ThreeD, &constants);
        description.time_window = TimeWindow::Seconds(10.5 * dt);
        let grid = Grid::new(&description, constants).unwrap();
        assert_eq!(grid.iterations(), 12);
        assert_eq!(grid.num_nodes(), 11 * 11 * 11);
        assert!(grid.fields().is_zero());
        assert!(grid.coefficients().is_none());
    }

    #[test]
    fn rejects_unstable_time_step() {
        let mut description = empty_model([10, 10, 10], 10);
        description.time_step_stability_factor = 1.5;
        assert!(Grid::new(&description, PhysicalConstants::SI).is_err());
    }
}
