//! Building and running a model.
//!
//! A model can be run several times, e.g. for a B-scan where sources and
//! receivers move by a fixed step between runs. With
//! [`GeometryLifecycle::Fixed`] the grid of the previous run is kept and only
//! its fields are cleared, otherwise it's rebuilt from the description.

use crate::{
    admission::{
        DeviceInfo,
        HostInfo,
    },
    config::ModelDescription,
    error::Error,
    grid::Grid,
    material::PhysicalConstants,
    output::ModelOutput,
    solver::{
        SolveObserver,
        Solver,
        SolverBackend,
    },
};

/// Which of several runs of a model this is. Runs are numbered from 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunIndex {
    pub current: usize,
    pub last: usize,
}

impl RunIndex {
    pub fn new(current: usize, last: usize) -> Self {
        Self { current, last }
    }

    pub fn single() -> Self {
        Self::new(1, 1)
    }

    pub fn is_first(&self) -> bool {
        self.current == 1
    }

    pub fn is_last(&self) -> bool {
        self.current == self.last
    }

    /// All runs from first to last.
    pub fn all(last: usize) -> impl Iterator<Item = RunIndex> {
        (1..=last).map(move |current| Self::new(current, last))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GeometryLifecycle {
    #[default]
    Rebuild,
    /// Keep the grid for the next run. Only sources and receivers move.
    Fixed,
}

/// Builds a grid ready for solving.
///
/// Fails before any large allocation if sources or receivers would be stepped
/// outside the domain on the last run, or if the model doesn't fit into
/// memory.
pub fn build_grid(
    description: &ModelDescription,
    physical_constants: PhysicalConstants,
    run: RunIndex,
    host: &HostInfo,
    device: Option<&DeviceInfo>,
) -> Result<Grid, Error> {
    let mut grid = Grid::new(description, physical_constants)?;
    grid.paint_geometry(&description.geometry)?;
    grid.build_pmls(&description.pml)?;
    grid.build_components();
    grid.create_source_materials();
    grid.apply_steps(run)?;
    grid.prepare(host, device)?;
    Ok(grid)
}

/// Runs models on one backend and keeps the grid between runs if asked to.
#[derive(Debug)]
pub struct Simulation<B> {
    backend: B,
    host: HostInfo,
    physical_constants: PhysicalConstants,
    grid: Option<Grid>,
}

impl<B: SolverBackend> Simulation<B> {
    pub fn new(backend: B, host: HostInfo) -> Self {
        Self {
            backend,
            host,
            physical_constants: PhysicalConstants::SI,
            grid: None,
        }
    }

    pub fn with_physical_constants(mut self, physical_constants: PhysicalConstants) -> Self {
        self.physical_constants = physical_constants;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Grid kept from the last run with fixed geometry.
    pub fn grid(&self) -> Option<&Grid> {
        self.grid.as_ref()
    }

    /// Builds (or reuses) the grid, runs all iterations and collects the
    /// outputs.
    pub fn run_model(
        &mut self,
        description: &ModelDescription,
        run: RunIndex,
        lifecycle: GeometryLifecycle,
        observer: &mut impl SolveObserver,
    ) -> Result<ModelOutput, Error> {
        let span = tracing::info_span!(
            "model",
            title = %description.title,
            run = run.current,
            runs = run.last,
            backend = self.backend.name(),
        );
        let _guard = span.enter();

        let grid = match (lifecycle, self.grid.take()) {
            (GeometryLifecycle::Fixed, Some(mut grid)) => {
                tracing::info!("reusing grid with fixed geometry");
                grid.reset();
                grid.apply_steps(run)?;
                grid
            }
            _ => {
                build_grid(
                    description,
                    self.physical_constants,
                    run,
                    &self.host,
                    self.backend.device_info(),
                )?
            }
        };

        let grid = self.grid.insert(grid);
        let iterations = grid.iterations();

        let instance = self.backend.create_instance(grid)?;
        let mut solver = Solver::new(instance, iterations);
        let solve_time = solver.run(observer)?;
        solver.finish()?;

        tracing::info!(?solve_time, iterations, "solved");

        let output = ModelOutput::from_grid(grid, run, solve_time, self.backend.name());

        if lifecycle == GeometryLifecycle::Rebuild {
            self.grid = None;
        }

        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use nalgebra::{
        Point3,
        Vector3,
    };

    use super::{
        GeometryLifecycle,
        RunIndex,
        Simulation,
        build_grid,
    };
    use crate::{
        admission::HostInfo,
        config::ModelDescription,
        error::Error,
        grid::Grid,
        material::PhysicalConstants,
        solver::cpu::{
            CpuBackend,
            tests::dipole_model,
        },
    };

    /// Builds a single-run grid without memory limits.
    pub fn prepared_grid(description: &ModelDescription) -> Grid {
        build_grid(
            description,
            PhysicalConstants::SI,
            RunIndex::single(),
            &HostInfo::new(u64::MAX),
            None,
        )
        .unwrap()
    }

    fn simulation() -> Simulation<CpuBackend> {
        Simulation::new(CpuBackend::single_threaded(), HostInfo::new(u64::MAX))
    }

    #[test]
    fn stepping_outside_fails_before_solving() {
        let mut description = dipole_model(10, 5);
        description.source_steps = Vector3::new(4e-3, 0.0, 0.0);

        let mut simulation = simulation();
        let result = simulation.run_model(
            &description,
            RunIndex::new(1, 3),
            GeometryLifecycle::Fixed,
            &mut (),
        );
        assert!(matches!(
            result,
            Err(Error::SourceSteppedOutside { run: 3, position: [13, 5, 5], .. })
        ));
        assert!(simulation.grid().is_none());
    }

    #[test]
    fn receivers_step_between_runs() {
        let mut description = dipole_model(10, 5);
        description.receiver_steps = Vector3::new(-1e-3, 0.0, 0.0);

        let mut simulation = simulation();
        for run in RunIndex::all(3) {
            let output = simulation
                .run_model(&description, run, GeometryLifecycle::Rebuild, &mut ())
                .unwrap();
            let expected = Point3::new(8.0 - (run.current - 1) as f64, 5.0, 5.0) * 1e-3;
            assert!((output.receivers[0].position - expected).norm() < 1e-12);
            assert_eq!(output.metadata.model_run, run.current);
        }
        assert!(simulation.grid().is_none());
    }

    #[test]
    fn fixed_geometry_is_reused() {
        let mut description = dipole_model(10, 30);
        description.sources[0].kind = crate::source::SourceKind::VoltageSource { resistance: 50.0 };

        let mut simulation = simulation();
        let first = simulation
            .run_model(&description, RunIndex::new(1, 2), GeometryLifecycle::Fixed, &mut ())
            .unwrap();
        let num_materials = simulation.grid().unwrap().materials().len();

        let second = simulation
            .run_model(&description, RunIndex::new(2, 2), GeometryLifecycle::Fixed, &mut ())
            .unwrap();
        assert_eq!(simulation.grid().unwrap().materials().len(), num_materials);
        assert_eq!(first.receivers[0].samples, second.receivers[0].samples);
        assert!(first.receivers[0].samples.iter().any(|sample| sample[2] != 0.0));
    }

    #[test]
    fn run_indices() {
        assert!(RunIndex::single().is_first());
        assert!(RunIndex::single().is_last());
        let runs = RunIndex::all(3).collect::<Vec<_>>();
        assert_eq!(runs.len(), 3);
        assert!(!runs[1].is_first());
        assert!(runs[2].is_last());
    }
}
