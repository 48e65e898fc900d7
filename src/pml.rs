//! Absorbing boundary regions.
//!
//! Each face with a non-zero thickness gets a [`PmlRegion`]. The main update
//! runs over the whole grid. The region then corrects the components that
//! are tangential to its face, using a recursive convolution with one
//! complex-frequency-shifted (CFS) stretching term per region.

use std::ops::Range;

use nalgebra::{
    Point3,
    Vector3,
};
use serde::{
    Deserialize,
    Serialize,
};
use smallvec::SmallVec;

use crate::{
    Real,
    coefficients::{
        CoefficientTable,
        SOURCE,
    },
    error::Error,
    grid::{
        Axis,
        FieldArrays,
        FieldComponent,
        Grid,
    },
    lattice::{
        Lattice,
        iter_points,
    },
    material::MaterialId,
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Face {
    XMin,
    YMin,
    ZMin,
    XMax,
    YMax,
    ZMax,
}

impl Face {
    pub fn axis(&self) -> Axis {
        match self {
            Face::XMin | Face::XMax => Axis::X,
            Face::YMin | Face::YMax => Axis::Y,
            Face::ZMin | Face::ZMax => Axis::Z,
        }
    }

    pub fn is_max(&self) -> bool {
        matches!(self, Face::XMax | Face::YMax | Face::ZMax)
    }
}

fn default_thickness() -> usize {
    10
}

/// Thickness in cells per face.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmlThickness {
    #[serde(default = "default_thickness")]
    pub x_min: usize,
    #[serde(default = "default_thickness")]
    pub y_min: usize,
    #[serde(default = "default_thickness")]
    pub z_min: usize,
    #[serde(default = "default_thickness")]
    pub x_max: usize,
    #[serde(default = "default_thickness")]
    pub y_max: usize,
    #[serde(default = "default_thickness")]
    pub z_max: usize,
}

impl Default for PmlThickness {
    fn default() -> Self {
        Self::uniform(default_thickness())
    }
}

impl PmlThickness {
    pub fn uniform(thickness: usize) -> Self {
        Self {
            x_min: thickness,
            y_min: thickness,
            z_min: thickness,
            x_max: thickness,
            y_max: thickness,
            z_max: thickness,
        }
    }

    pub fn get(&self, face: Face) -> usize {
        match face {
            Face::XMin => self.x_min,
            Face::YMin => self.y_min,
            Face::ZMin => self.z_min,
            Face::XMax => self.x_max,
            Face::YMax => self.y_max,
            Face::ZMax => self.z_max,
        }
    }

    pub fn get_mut(&mut self, face: Face) -> &mut usize {
        match face {
            Face::XMin => &mut self.x_min,
            Face::YMin => &mut self.y_min,
            Face::ZMin => &mut self.z_min,
            Face::XMax => &mut self.x_max,
            Face::YMax => &mut self.y_max,
            Face::ZMax => &mut self.z_max,
        }
    }

    pub fn is_off(&self) -> bool {
        <Face as strum::VariantArray>::VARIANTS
            .iter()
            .all(|face| self.get(*face) == 0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingProfile {
    Constant,
    Linear,
    Quadratic,
    Cubic,
    Quartic,
    Quintic,
    Sextic,
}

impl ScalingProfile {
    /// Polynomial order, or `None` for a constant profile.
    pub fn order(&self) -> Option<i32> {
        match self {
            ScalingProfile::Constant => None,
            ScalingProfile::Linear => Some(1),
            ScalingProfile::Quadratic => Some(2),
            ScalingProfile::Cubic => Some(3),
            ScalingProfile::Quartic => Some(4),
            ScalingProfile::Quintic => Some(5),
            ScalingProfile::Sextic => Some(6),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    /// Increasing into the region.
    #[default]
    Forward,
    /// Decreasing into the region.
    Backward,
}

/// Grading of one CFS parameter across the region.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CfsParameter {
    pub profile: ScalingProfile,
    #[serde(default)]
    pub direction: ScalingDirection,
    #[serde(default)]
    pub min: f64,
    /// For sigma this is computed from the material behind the face if not
    /// given.
    #[serde(default)]
    pub max: Option<f64>,
}

impl CfsParameter {
    pub fn constant(value: f64) -> Self {
        Self {
            profile: ScalingProfile::Constant,
            direction: ScalingDirection::Forward,
            min: value,
            max: Some(value),
        }
    }

    /// Values at the electric and magnetic positions of each depth.
    ///
    /// Electric positions are at whole cells from the inner face, magnetic
    /// positions half a cell further out.
    pub fn values(&self, thickness: usize, max: f64) -> (Vec<f64>, Vec<f64>) {
        let d = thickness as f64;
        let Some(order) = self.profile.order()
        else {
            return (vec![max; thickness], vec![max; thickness]);
        };
        let scale = |x: f64| (x / d).powi(order) * (max - self.min) + self.min;

        match self.direction {
            ScalingDirection::Forward => {
                (0..thickness)
                    .map(|i| (scale(i as f64), scale(i as f64 + 0.5)))
                    .unzip()
            }
            // Mirrored about the outer face: electric samples run from `d` down
            // to 1, magnetic ones sit half a cell inwards of each.
            ScalingDirection::Backward => {
                (0..thickness)
                    .map(|i| {
                        let x = (thickness - i) as f64;
                        (scale(x), scale(x - 0.5))
                    })
                    .unzip()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cfs {
    #[serde(default = "default_alpha")]
    pub alpha: CfsParameter,
    #[serde(default = "default_kappa")]
    pub kappa: CfsParameter,
    #[serde(default = "default_sigma")]
    pub sigma: CfsParameter,
}

fn default_alpha() -> CfsParameter {
    CfsParameter::constant(0.0)
}

fn default_kappa() -> CfsParameter {
    CfsParameter::constant(1.0)
}

fn default_sigma() -> CfsParameter {
    CfsParameter {
        profile: ScalingProfile::Quartic,
        direction: ScalingDirection::Forward,
        min: 0.0,
        max: None,
    }
}

impl Default for Cfs {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            kappa: default_kappa(),
            sigma: default_sigma(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PmlDescription {
    #[serde(default)]
    pub thickness: PmlThickness,
    #[serde(default)]
    pub cfs: Cfs,
}

impl PmlDescription {
    pub fn off() -> Self {
        Self {
            thickness: PmlThickness::uniform(0),
            cfs: Cfs::default(),
        }
    }
}

/// Recursive convolution coefficients per depth.
#[derive(Clone, Debug, Default)]
pub struct PmlProfile {
    pub ra: Vec<Real>,
    pub rb: Vec<Real>,
    pub re: Vec<Real>,
    pub rf: Vec<Real>,
}

impl PmlProfile {
    fn new(alpha: &[f64], kappa: &[f64], sigma: &[f64], dt: f64, vacuum_permittivity: f64) -> Self {
        let e0 = vacuum_permittivity;
        let mut profile = Self::default();
        for ((alpha, kappa), sigma) in alpha.iter().zip(kappa).zip(sigma) {
            let loss = dt * (alpha * kappa + sigma);
            let tmp = 2.0 * e0 * kappa + loss;
            profile.ra.push(((2.0 * e0 + dt * alpha) / tmp) as Real);
            profile.rb.push((2.0 * e0 * kappa / tmp) as Real);
            profile.re.push(((2.0 * e0 * kappa - loss) / tmp) as Real);
            profile.rf.push((2.0 * sigma * dt / (kappa * tmp)) as Real);
        }
        profile
    }

    pub fn len(&self) -> usize {
        self.ra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ra.is_empty()
    }
}

/// Correction of one tangential field component in a region.
#[derive(Clone, derive_more::Debug)]
pub struct PmlCorrection {
    /// Component being corrected.
    pub component: FieldComponent,
    /// Component whose normal derivative enters the correction.
    pub derivative_of: FieldComponent,
    /// Sign of the derivative term in the main update.
    pub sign: Real,
    /// Nodes to correct, in grid coordinates.
    pub range: Range<Point3<usize>>,
    /// Auxiliary array, indexed by depth along the normal and grid
    /// coordinates across it.
    #[debug(skip)]
    pub phi: Lattice<Real>,
}

impl PmlCorrection {
    fn new(
        region: &RegionShape,
        component: FieldComponent,
        derivative_of: FieldComponent,
        cells: &Vector3<usize>,
    ) -> Self {
        let normal = region.face.axis().index();
        let electric = component.is_electric();

        // curl sign of the term, negated for the magnetic update
        let parity = levi_civita(
            component.axis().index(),
            normal,
            derivative_of.axis().index(),
        );
        let sign = if electric { parity } else { -parity };

        let nodes = region.nodes_along_normal(electric);
        let mut range = component.update_range(cells);
        range.start[normal] = range.start[normal].max(nodes.start);
        range.end[normal] = range.end[normal].min(nodes.end).max(range.start[normal]);

        let mut phi_size = cells.add_scalar(1);
        phi_size[normal] = region.thickness;

        Self {
            component,
            derivative_of,
            sign: sign as Real,
            range,
            phi: Lattice::from_value(&phi_size, 0.0),
        }
    }

    fn apply(
        &mut self,
        fields: &mut FieldArrays,
        ids: &Lattice<[MaterialId; 6]>,
        table: &CoefficientTable<Real>,
        profile: &PmlProfile,
        region: &RegionShape,
        inverse_spacing: Real,
    ) {
        let normal = region.face.axis().index();
        let electric = self.component.is_electric();
        let strider = *ids.strider();
        let offset = strider.strides()[normal];
        let phi_strider = *self.phi.strider();

        for (index, node) in strider.iter(self.range.clone()) {
            let source = fields.component(self.derivative_of);
            let difference = if electric {
                source[index] - source[index - offset]
            }
            else {
                source[index + offset] - source[index]
            };
            let delta = difference * inverse_spacing;

            let depth = region.depth(node[normal], electric);
            let mut local = node;
            local[normal] = depth;
            let phi = &mut self.phi[phi_strider.index_unchecked(&local)];

            let coefficient = table.row(ids[index][self.component.index()])[SOURCE];
            fields.component_mut(self.component)[index] += self.sign
                * coefficient
                * ((profile.ra[depth] - 1.0) * delta + profile.rb[depth] * *phi);
            *phi = profile.re[depth] * *phi - profile.rf[depth] * delta;
        }
    }
}

/// Where a region sits in the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionShape {
    pub face: Face,
    pub thickness: usize,
    /// Cells along the normal.
    pub cells_along_normal: usize,
}

impl RegionShape {
    /// Depth (0 at the inner face) of a node along the normal.
    #[inline(always)]
    pub fn depth(&self, node: usize, electric: bool) -> usize {
        if self.face.is_max() {
            node + self.thickness - self.cells_along_normal
        }
        else if electric {
            self.thickness - node
        }
        else {
            self.thickness - 1 - node
        }
    }

    /// Nodes along the normal that are inside the region.
    pub fn nodes_along_normal(&self, electric: bool) -> Range<usize> {
        if self.face.is_max() {
            self.cells_along_normal - self.thickness..self.cells_along_normal
        }
        else if electric {
            1..self.thickness + 1
        }
        else {
            0..self.thickness
        }
    }

    /// First cell of the region along the normal.
    fn start_cell(&self) -> usize {
        if self.face.is_max() {
            self.cells_along_normal - self.thickness
        }
        else {
            0
        }
    }
}

#[derive(Clone, Debug)]
pub struct PmlRegion {
    shape: RegionShape,
    electric_profile: PmlProfile,
    magnetic_profile: PmlProfile,
    electric: SmallVec<[PmlCorrection; 2]>,
    magnetic: SmallVec<[PmlCorrection; 2]>,
    inverse_spacing: Real,
}

impl PmlRegion {
    pub fn new(
        face: Face,
        thickness: usize,
        cfs: &Cfs,
        grid: &Grid,
    ) -> Self {
        let axis = face.axis();
        let normal = axis.index();
        let shape = RegionShape {
            face,
            thickness,
            cells_along_normal: grid.cells[normal],
        };

        // average material properties on the region's first slab
        let mut slab_start = Point3::origin();
        let mut slab_end = Point3::from(grid.cells);
        slab_start[normal] = shape.start_cell();
        slab_end[normal] = shape.start_cell() + 1;
        let (mut sum_er, mut sum_mr, mut count) = (0.0, 0.0, 0usize);
        for cell in iter_points(slab_start..slab_end, grid.cells) {
            let material = grid.materials.get(grid.solid[cell]);
            sum_er += material.relative_permittivity;
            sum_mr += material.relative_permeability;
            count += 1;
        }
        let count = count.max(1) as f64;
        let (er, mr) = (sum_er / count, sum_mr / count);

        let spacing = grid.spacing[normal];
        let constants = &grid.physical_constants;
        let sigma_max = cfs.sigma.max.unwrap_or_else(|| {
            let order = cfs.sigma.profile.order().unwrap_or(0) as f64;
            0.8 * (order + 1.0) / (constants.vacuum_impedance() * spacing * (er * mr).sqrt())
        });

        let (alpha_e, alpha_h) = cfs
            .alpha
            .values(thickness, cfs.alpha.max.unwrap_or(cfs.alpha.min));
        let (kappa_e, kappa_h) = cfs
            .kappa
            .values(thickness, cfs.kappa.max.unwrap_or(cfs.kappa.min));
        let (sigma_e, sigma_h) = cfs.sigma.values(thickness, sigma_max);

        let e0 = constants.vacuum_permittivity;
        let electric_profile = PmlProfile::new(&alpha_e, &kappa_e, &sigma_e, grid.dt, e0);
        let magnetic_profile = PmlProfile::new(&alpha_h, &kappa_h, &sigma_h, grid.dt, e0);

        let [b, c] = axis.transverse();
        let electric = [(b, c), (c, b)]
            .into_iter()
            .map(|(tangential, other)| {
                PmlCorrection::new(
                    &shape,
                    FieldComponent::electric(tangential),
                    FieldComponent::magnetic(other),
                    &grid.cells,
                )
            })
            .collect();
        let magnetic = [(b, c), (c, b)]
            .into_iter()
            .map(|(tangential, other)| {
                PmlCorrection::new(
                    &shape,
                    FieldComponent::magnetic(tangential),
                    FieldComponent::electric(other),
                    &grid.cells,
                )
            })
            .collect();

        tracing::debug!(%face, thickness, er, mr, sigma_max, "created pml region");

        Self {
            shape,
            electric_profile,
            magnetic_profile,
            electric,
            magnetic,
            inverse_spacing: (1.0 / spacing) as Real,
        }
    }

    pub fn face(&self) -> Face {
        self.shape.face
    }

    pub fn thickness(&self) -> usize {
        self.shape.thickness
    }

    pub fn shape(&self) -> &RegionShape {
        &self.shape
    }

    pub fn inverse_spacing(&self) -> Real {
        self.inverse_spacing
    }

    pub fn electric_profile(&self) -> &PmlProfile {
        &self.electric_profile
    }

    pub fn magnetic_profile(&self) -> &PmlProfile {
        &self.magnetic_profile
    }

    pub fn electric_corrections(&self) -> &[PmlCorrection] {
        &self.electric
    }

    pub fn magnetic_corrections(&self) -> &[PmlCorrection] {
        &self.magnetic
    }

    pub fn update_electric(
        &mut self,
        fields: &mut FieldArrays,
        ids: &Lattice<[MaterialId; 6]>,
        table: &CoefficientTable<Real>,
    ) {
        for correction in &mut self.electric {
            correction.apply(
                fields,
                ids,
                table,
                &self.electric_profile,
                &self.shape,
                self.inverse_spacing,
            );
        }
    }

    pub fn update_magnetic(
        &mut self,
        fields: &mut FieldArrays,
        ids: &Lattice<[MaterialId; 6]>,
        table: &CoefficientTable<Real>,
    ) {
        for correction in &mut self.magnetic {
            correction.apply(
                fields,
                ids,
                table,
                &self.magnetic_profile,
                &self.shape,
                self.inverse_spacing,
            );
        }
    }

    /// Zeroes the auxiliary arrays. Coefficients are kept.
    pub fn reset(&mut self) {
        for correction in self.electric.iter_mut().chain(&mut self.magnetic) {
            correction.phi.fill(0.0);
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        let phi = self
            .electric
            .iter()
            .chain(&self.magnetic)
            .map(|correction| correction.phi.len())
            .sum::<usize>();
        let profiles = 4 * (self.electric_profile.len() + self.magnetic_profile.len());
        (phi + profiles) * size_of::<Real>()
    }
}

/// Parity of the permutation `(i, j, k)` of the axes, or 0 if two coincide.
fn levi_civita(i: usize, j: usize, k: usize) -> i32 {
    match (i, j, k) {
        (0, 1, 2) | (1, 2, 0) | (2, 0, 1) => 1,
        (0, 2, 1) | (2, 1, 0) | (1, 0, 2) => -1,
        _ => 0,
    }
}

/// Thickness per face after forcing the invariant axis of 2D models to zero.
pub fn effective_thickness(grid: &Grid, thickness: &PmlThickness) -> PmlThickness {
    let mut thickness = *thickness;
    if let Some(axis) = grid.mode.invariant_axis() {
        for face in <Face as strum::VariantArray>::VARIANTS {
            if face.axis() == axis {
                *thickness.get_mut(*face) = 0;
            }
        }
    }
    thickness
}

impl Grid {
    /// Creates a region for every face with non-zero thickness.
    pub fn build_pmls(&mut self, description: &PmlDescription) -> Result<(), Error> {
        let thickness = effective_thickness(self, &description.thickness);

        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let faces = <Face as strum::VariantArray>::VARIANTS
                .iter()
                .filter(|face| face.axis() == axis);
            let total = faces.map(|face| thickness.get(*face)).sum::<usize>();
            if total > self.cells[axis.index()] {
                return Err(Error::InvalidConfig(format!(
                    "pml thickness {total} along {axis} exceeds domain of {} cells",
                    self.cells[axis.index()]
                )));
            }
        }

        self.pmls.clear();
        for face in <Face as strum::VariantArray>::VARIANTS {
            let d = thickness.get(*face);
            if d > 0 {
                let region = PmlRegion::new(*face, d, &description.cfs, self);
                self.pmls.push(region);
            }
        }

        if self.pmls.is_empty() {
            tracing::debug!("pml off");
        }

        Ok(())
    }
}
