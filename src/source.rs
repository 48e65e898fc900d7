//! Sources and their per-iteration injection into the grid.
//!
//! Every source has precomputed waveform values for each iteration. The
//! electric value `J` is taken half a time step later than the magnetic value
//! `M`, matching the leapfrog staggering.

use nalgebra::{
    Point3,
    Vector3,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    Real,
    coefficients::{
        SOURCE,
        UpdateCoefficients,
    },
    error::Error,
    grid::{
        Axis,
        FieldArrays,
        FieldComponent,
        Grid,
    },
    lattice::Lattice,
    material::{
        MaterialId,
        MaterialKind,
    },
    model::RunIndex,
    waveform::{
        Waveform,
        find_waveform,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    HertzianDipole,
    MagneticDipole,
    VoltageSource {
        /// Internal resistance in Ohm. Zero makes it a hard source.
        #[serde(default)]
        resistance: f64,
    },
    TransmissionLine {
        /// Characteristic resistance in Ohm.
        resistance: f64,
    },
}

impl SourceKind {
    fn name(&self) -> &'static str {
        match self {
            SourceKind::HertzianDipole => "hertzian_dipole",
            SourceKind::MagneticDipole => "magnetic_dipole",
            SourceKind::VoltageSource { .. } => "voltage_source",
            SourceKind::TransmissionLine { .. } => "transmission_line",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceDescription {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub kind: SourceKind,
    pub polarisation: Axis,
    /// Position in metres.
    pub position: Point3<f64>,
    /// ID of the waveform.
    pub waveform: String,
    /// Switch-on time in seconds.
    #[serde(default)]
    pub start: f64,
    /// Switch-off time in seconds.
    #[serde(default)]
    pub stop: Option<f64>,
}

/// Common state of all source kinds.
#[derive(Clone, derive_more::Debug)]
pub struct Source {
    pub id: String,
    pub polarisation: Axis,
    /// Node the source was defined at.
    pub origin: Point3<usize>,
    /// Node the source is at in the current run.
    pub position: Point3<usize>,
    pub start: f64,
    pub stop: f64,
    #[debug(skip)]
    pub waveform_j: Box<[Real]>,
    #[debug(skip)]
    pub waveform_m: Box<[Real]>,
}

impl Source {
    fn new(
        grid: &Grid,
        index: usize,
        description: &SourceDescription,
        waveform: &Waveform,
    ) -> Result<Self, Error> {
        let id = description
            .id
            .clone()
            .unwrap_or_else(|| format!("{}_{index}", description.kind.name()));

        let position = description
            .position
            .coords
            .component_div(&grid.spacing)
            .map(f64::round);
        if (0..3).any(|axis| position[axis] < 0.0 || position[axis] > grid.cells[axis] as f64) {
            return Err(Error::OutsideGrid {
                what: format!("Source '{id}'"),
                position: position.map(|x| x.max(0.0) as usize).into(),
                polarisation: description.polarisation,
            });
        }
        let position: Point3<usize> = position.map(|x| x as usize).into();

        let start = description.start;
        let stop = description.stop.unwrap_or(f64::INFINITY);
        let dt = grid.dt;
        let (waveform_j, waveform_m) = (0..grid.iterations)
            .map(|iteration| {
                let time = iteration as f64 * dt;
                if start <= time && time <= stop {
                    (
                        waveform.value(time - start + 0.5 * dt, dt) as Real,
                        waveform.value(time - start, dt) as Real,
                    )
                }
                else {
                    (0.0, 0.0)
                }
            })
            .unzip::<_, _, Vec<_>, Vec<_>>();

        Ok(Self {
            id,
            polarisation: description.polarisation,
            origin: position,
            position,
            start,
            stop,
            waveform_j: waveform_j.into_boxed_slice(),
            waveform_m: waveform_m.into_boxed_slice(),
        })
    }

    pub fn is_active(&self, iteration: usize, dt: f64) -> bool {
        let time = iteration as f64 * dt;
        self.start <= time && time <= self.stop
    }

    fn value_j(&self, iteration: usize) -> Real {
        self.waveform_j.get(iteration).copied().unwrap_or_default()
    }

    fn value_m(&self, iteration: usize) -> Real {
        self.waveform_m.get(iteration).copied().unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct VoltageSource {
    pub source: Source,
    pub resistance: f64,
}

/// One-dimensional transmission line feeding an edge of the grid.
#[derive(Clone, derive_more::Debug)]
pub struct TransmissionLine {
    pub source: Source,
    pub resistance: f64,
    /// Spatial step of the line.
    pub dl: f64,
    /// Number of line cells in use.
    pub nl: usize,
    #[debug(skip)]
    pub voltage: Vec<Real>,
    #[debug(skip)]
    pub current: Vec<Real>,
    abc_v0: Real,
    abc_v1: Real,
    /// `c dt / dl`
    courant: Real,
    /// `(c dt - dl)/(c dt + dl)`
    abc_coefficient: Real,
    #[debug(skip)]
    pub incident_voltage: Vec<Real>,
    #[debug(skip)]
    pub incident_current: Vec<Real>,
    #[debug(skip)]
    pub total_voltage: Vec<Real>,
    #[debug(skip)]
    pub total_current: Vec<Real>,
}

impl TransmissionLine {
    /// Line cell of the one-way injector.
    pub const SOURCE_POSITION: usize = 5;
    /// Line cell connected to the grid.
    pub const ANTENNA_POSITION: usize = 10;

    fn new(source: Source, resistance: f64, dt: f64, speed_of_light: f64, iterations: usize) -> Result<Self, Error> {
        if !(resistance > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "transmission line '{}' needs a positive resistance",
                source.id
            )));
        }

        let dl = 3f64.sqrt() * speed_of_light * dt;
        // a long line first, so the incident wave isn't reflected back
        let nl = ((0.667 * iterations as f64).round() as usize).max(Self::ANTENNA_POSITION + 1);
        let c_dt = speed_of_light * dt;

        let mut line = Self {
            source,
            resistance,
            dl,
            nl,
            voltage: vec![0.0; nl],
            current: vec![0.0; nl],
            abc_v0: 0.0,
            abc_v1: 0.0,
            courant: (c_dt / dl) as Real,
            abc_coefficient: ((c_dt - dl) / (c_dt + dl)) as Real,
            incident_voltage: vec![0.0; iterations],
            incident_current: vec![0.0; iterations],
            total_voltage: vec![0.0; iterations],
            total_current: vec![0.0; iterations],
        };

        line.calculate_incident(iterations);
        Ok(line)
    }

    /// Runs the isolated line to record the incident voltage and current at
    /// the antenna, then shortens it for use with the grid.
    fn calculate_incident(&mut self, iterations: usize) {
        for iteration in 0..iterations {
            self.incident_voltage[iteration] = self.voltage[Self::ANTENNA_POSITION];
            self.incident_current[iteration] = self.current[Self::ANTENNA_POSITION];
            self.update_current(iteration);
            self.update_voltage(iteration);
        }

        self.nl = Self::ANTENNA_POSITION + 1;
        self.voltage.truncate(self.nl);
        self.current.truncate(self.nl);
        self.reset();
    }

    fn update_voltage(&mut self, iteration: usize) {
        let factor = self.resistance as Real * self.courant;
        for n in 1..self.nl {
            self.voltage[n] -= factor * (self.current[n] - self.current[n - 1]);
        }
        self.voltage[Self::SOURCE_POSITION] += self.courant * self.source.value_j(iteration);

        // absorbing termination at the far end
        self.voltage[0] = self.abc_coefficient * (self.voltage[1] - self.abc_v0) + self.abc_v1;
        self.abc_v0 = self.voltage[0];
        self.abc_v1 = self.voltage[1];
    }

    fn update_current(&mut self, iteration: usize) {
        let factor = self.courant / self.resistance as Real;
        for n in 0..self.nl - 1 {
            self.current[n] -= factor * (self.voltage[n + 1] - self.voltage[n]);
        }
        self.current[Self::SOURCE_POSITION - 1] += factor * self.source.value_m(iteration);
    }

    pub fn antenna_voltage(&self) -> Real {
        self.voltage[Self::ANTENNA_POSITION]
    }

    pub fn antenna_current(&self) -> Real {
        self.current[Self::ANTENNA_POSITION]
    }

    /// Zeroes the line state and totals. The incident values are kept.
    pub fn reset(&mut self) {
        self.voltage.fill(0.0);
        self.current.fill(0.0);
        self.abc_v0 = 0.0;
        self.abc_v1 = 0.0;
        self.total_voltage.fill(0.0);
        self.total_current.fill(0.0);
    }

    pub fn store_outputs(&mut self, iteration: usize) {
        if iteration < self.total_voltage.len() {
            self.total_voltage[iteration] = self.antenna_voltage();
            self.total_current[iteration] = self.antenna_current();
        }
    }
}

/// Current circulating the edge at `node` with polarisation `axis`, computed
/// from the surrounding magnetic field.
pub fn loop_current(
    fields: &FieldArrays,
    spacing: &Vector3<f64>,
    axis: Axis,
    node: &Point3<usize>,
) -> Real {
    let b = Axis::from_index(axis.index() + 1);
    let c = Axis::from_index(axis.index() + 2);
    if node[b.index()] == 0 || node[c.index()] == 0 {
        return 0.0;
    }
    let below = |axis: Axis| {
        let mut node = *node;
        node[axis.index()] -= 1;
        node
    };
    let h_b = fields.component(FieldComponent::magnetic(b));
    let h_c = fields.component(FieldComponent::magnetic(c));
    let d_b = spacing[b.index()] as Real;
    let d_c = spacing[c.index()] as Real;

    // (axis, b, c) is cyclic, so this is the right-handed circulation
    d_b * (h_b[below(c)] - h_b[*node]) + d_c * (h_c[*node] - h_c[below(b)])
}

/// All sources of a model, grouped by kind in update order.
#[derive(Clone, Debug, Default)]
pub struct Sources {
    pub hertzian_dipoles: Vec<Source>,
    pub magnetic_dipoles: Vec<Source>,
    pub voltage_sources: Vec<VoltageSource>,
    pub transmission_lines: Vec<TransmissionLine>,
}

impl Sources {
    pub fn new(grid: &Grid, descriptions: &[SourceDescription]) -> Result<Self, Error> {
        let mut sources = Self::default();

        for (index, description) in descriptions.iter().enumerate() {
            let waveform = find_waveform(&grid.waveforms, &description.waveform)?;
            let source = Source::new(grid, index, description, waveform)?;

            match description.kind {
                SourceKind::HertzianDipole => sources.hertzian_dipoles.push(source),
                SourceKind::MagneticDipole => sources.magnetic_dipoles.push(source),
                SourceKind::VoltageSource { resistance } => {
                    sources
                        .voltage_sources
                        .push(VoltageSource { source, resistance })
                }
                SourceKind::TransmissionLine { resistance } => {
                    sources.transmission_lines.push(TransmissionLine::new(
                        source,
                        resistance,
                        grid.dt,
                        grid.physical_constants.speed_of_light(),
                        grid.iterations,
                    )?)
                }
            }
        }

        Ok(sources)
    }

    pub fn is_empty(&self) -> bool {
        self.hertzian_dipoles.is_empty()
            && self.magnetic_dipoles.is_empty()
            && self.voltage_sources.is_empty()
            && self.transmission_lines.is_empty()
    }

    /// Sources that move between runs.
    pub fn steppable_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.hertzian_dipoles
            .iter_mut()
            .chain(self.magnetic_dipoles.iter_mut())
    }

    pub fn reset(&mut self) {
        for line in &mut self.transmission_lines {
            line.reset();
        }
    }

    /// Magnetic-type sources: transmission lines, then magnetic dipoles.
    pub fn update_magnetic(
        &mut self,
        iteration: usize,
        dt: f64,
        fields: &mut FieldArrays,
        ids: &Lattice<[MaterialId; 6]>,
        coefficients: &UpdateCoefficients,
        spacing: &Vector3<f64>,
    ) {
        let volume = spacing.product();

        for line in &mut self.transmission_lines {
            if line.source.is_active(iteration, dt) {
                line.current[TransmissionLine::ANTENNA_POSITION] =
                    loop_current(fields, spacing, line.source.polarisation, &line.source.position);
                line.update_current(iteration);
            }
        }

        for source in &self.magnetic_dipoles {
            if source.is_active(iteration, dt) {
                let component = FieldComponent::magnetic(source.polarisation);
                let index = ids.strider().index_unchecked(&source.position);
                let srcm = coefficients.magnetic.row(ids[index][component.index()])[SOURCE];
                fields.component_mut(component)[index] -=
                    srcm * (source.value_m(iteration) as f64 / volume) as Real;
            }
        }
    }

    /// Electric-type sources: voltage sources, transmission lines, and
    /// hertzian dipoles last.
    pub fn update_electric(
        &mut self,
        iteration: usize,
        dt: f64,
        fields: &mut FieldArrays,
        ids: &Lattice<[MaterialId; 6]>,
        coefficients: &UpdateCoefficients,
        spacing: &Vector3<f64>,
    ) {
        let volume = spacing.product();

        for voltage_source in &self.voltage_sources {
            let source = &voltage_source.source;
            if source.is_active(iteration, dt) {
                let p = source.polarisation.index();
                let component = FieldComponent::electric(source.polarisation);
                let index = ids.strider().index_unchecked(&source.position);
                let value = source.value_j(iteration) as f64;

                if voltage_source.resistance != 0.0 {
                    let area = volume / spacing[p];
                    let srce = coefficients.electric.row(ids[index][component.index()])[SOURCE];
                    fields.component_mut(component)[index] -=
                        srce * (value / (voltage_source.resistance * area)) as Real;
                }
                else {
                    fields.component_mut(component)[index] = (-value / spacing[p]) as Real;
                }
            }
        }

        for line in &mut self.transmission_lines {
            if line.source.is_active(iteration, dt) {
                line.update_voltage(iteration);
                let p = line.source.polarisation;
                let index = ids.strider().index_unchecked(&line.source.position);
                fields.component_mut(FieldComponent::electric(p))[index] =
                    -line.antenna_voltage() / spacing[p.index()] as Real;
            }
        }

        for source in &self.hertzian_dipoles {
            if source.is_active(iteration, dt) {
                let p = source.polarisation.index();
                let component = FieldComponent::electric(source.polarisation);
                let index = ids.strider().index_unchecked(&source.position);
                let srce = coefficients.electric.row(ids[index][component.index()])[SOURCE];
                fields.component_mut(component)[index] -=
                    srce * (source.value_j(iteration) as f64 * spacing[p] / volume) as Real;
            }
        }
    }
}

/// Coordinate on a run, or the offending coordinate if it leaves the domain.
pub fn stepped_position(
    origin: &Point3<usize>,
    step: &Vector3<i64>,
    run: usize,
    cells: &Vector3<usize>,
) -> Result<Point3<usize>, [i64; 3]> {
    let runs = run.saturating_sub(1) as i64;
    let position = origin.coords.map(|x| x as i64) + step * runs;
    if (0..3).any(|axis| position[axis] < 0 || position[axis] > cells[axis] as i64) {
        Err(position.into())
    }
    else {
        Ok(position.map(|x| x as usize).into())
    }
}

impl Grid {
    /// Creates a material for the internal resistance of every voltage source
    /// with non-zero resistance and assigns it to the source's edge.
    ///
    /// Must run after the edge IDs are built.
    pub fn create_source_materials(&mut self) {
        for voltage_source in &self.sources.voltage_sources {
            if voltage_source.resistance == 0.0 {
                continue;
            }

            let source = &voltage_source.source;
            let p = source.polarisation.index();
            let component = FieldComponent::electric(source.polarisation);
            let id = &mut self.ids[source.position][component.index()];

            let mut material = self.materials.get(*id).clone();
            material.name = format!("{}+{}", material.name, source.id);
            material.averagable = false;
            material.kind = MaterialKind::VoltageSource;
            material.electric_conductivity +=
                self.spacing[p] / (voltage_source.resistance * self.spacing.product() / self.spacing[p]);

            tracing::debug!(name = %material.name, se = material.electric_conductivity, "created voltage source material");

            *id = self.materials.push(material);
        }
    }

    /// Moves steppable sources and receivers to their position on `run`.
    ///
    /// On the first run this also checks that the last run stays inside the
    /// domain.
    pub fn apply_steps(&mut self, run: RunIndex) -> Result<(), Error> {
        let cells = self.cells;

        if self.source_steps != Vector3::zeros() {
            let step = self.source_steps;
            if run.is_first() {
                for source in self.sources.steppable_mut() {
                    stepped_position(&source.origin, &step, run.last, &cells).map_err(|position| {
                        Error::SourceSteppedOutside {
                            source_id: source.id.clone(),
                            position,
                            run: run.last,
                        }
                    })?;
                }
            }
            for source in self.sources.steppable_mut() {
                source.position = stepped_position(&source.origin, &step, run.current, &cells)
                    .map_err(|position| {
                        Error::SourceSteppedOutside {
                            source_id: source.id.clone(),
                            position,
                            run: run.current,
                        }
                    })?;
            }
        }

        if self.receiver_steps != Vector3::zeros() {
            let step = self.receiver_steps;
            if run.is_first() {
                for receiver in &self.receivers {
                    stepped_position(&receiver.origin, &step, run.last, &cells).map_err(
                        |position| {
                            Error::ReceiverSteppedOutside {
                                receiver_id: receiver.id.clone(),
                                position,
                                run: run.last,
                            }
                        },
                    )?;
                }
            }
            for receiver in &mut self.receivers {
                receiver.position = stepped_position(&receiver.origin, &step, run.current, &cells)
                    .map_err(|position| {
                        Error::ReceiverSteppedOutside {
                            receiver_id: receiver.id.clone(),
                            position,
                            run: run.current,
                        }
                    })?;
            }
        }

        Ok(())
    }
}
