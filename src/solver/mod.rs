//! Leapfrog time stepping.
//!
//! A backend turns a prepared [`Grid`] into something that implements
//! [`LeapfrogStep`]. [`Solver`] then drives the steps in the fixed order of
//! one iteration:
//!
//! 1. store receiver outputs
//! 2. snapshots, if the observer wants one
//! 3. magnetic update, magnetic PML correction, magnetic sources
//! 4. electric update (phase A if dispersive), electric PML correction,
//!    electric sources
//! 5. dispersive phase B

pub mod cpu;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use std::time::{
    Duration,
    Instant,
};

use crate::{
    admission::DeviceInfo,
    error::Error,
    grid::{
        FieldArrays,
        Grid,
    },
};

/// One method per step of an iteration.
///
/// Implementations may defer work (e.g. GPU command submission), but the
/// effect must be as if every step ran to completion in order.
pub trait LeapfrogStep {
    fn store_outputs(&mut self, iteration: usize);

    fn update_magnetic(&mut self);

    fn update_magnetic_pml(&mut self);

    fn update_magnetic_sources(&mut self, iteration: usize);

    /// Standard electric update, or phase A of the dispersive update.
    fn update_electric(&mut self);

    fn update_electric_pml(&mut self);

    fn update_electric_sources(&mut self, iteration: usize);

    /// Phase B of the dispersive update. Does nothing without dispersive
    /// materials.
    fn update_electric_dispersive(&mut self);

    /// Calls `f` with the current fields.
    fn with_fields(&mut self, f: &mut dyn FnMut(&FieldArrays)) -> Result<(), Error>;

    /// Makes all results visible in the grid.
    fn finish(&mut self) -> Result<(), Error>;
}

/// Hooks into the solve loop. All methods default to doing nothing.
pub trait SolveObserver {
    fn snapshot_due(&mut self, iteration: usize) -> bool {
        let _ = iteration;
        false
    }

    /// Called before the magnetic update of `iteration`.
    fn snapshot(&mut self, iteration: usize, fields: &FieldArrays) {
        let _ = (iteration, fields);
    }

    fn iteration_done(&mut self, iteration: usize) {
        let _ = iteration;
    }
}

impl SolveObserver for () {}

pub trait SolverBackend {
    type Instance<'a>: LeapfrogStep
    where
        Self: 'a;

    fn name(&self) -> &'static str;

    /// Device the admission check has to consider, if any.
    fn device_info(&self) -> Option<&DeviceInfo> {
        None
    }

    fn create_instance<'a>(&'a self, grid: &'a mut Grid) -> Result<Self::Instance<'a>, Error>;
}

/// Runs the leapfrog loop of a backend instance.
#[derive(Debug)]
pub struct Solver<S> {
    step: S,
    iteration: usize,
    iterations: usize,
}

impl<S> Solver<S>
where
    S: LeapfrogStep,
{
    pub fn new(step: S, iterations: usize) -> Self {
        Self {
            step,
            iteration: 0,
            iterations,
        }
    }

    /// Next iteration to run.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Runs the next `iterations` iterations and returns the wall-clock time
    /// it took.
    pub fn advance(
        &mut self,
        iterations: usize,
        observer: &mut impl SolveObserver,
    ) -> Result<Duration, Error> {
        if self.iteration + iterations > self.iterations {
            return Err(Error::IterationsExhausted {
                done: self.iteration,
                total: self.iterations,
                requested: iterations,
            });
        }

        let span = tracing::info_span!("solve", start = self.iteration, iterations);
        let _guard = span.enter();
        let start_time = Instant::now();

        for iteration in self.iteration..self.iteration + iterations {
            self.step.store_outputs(iteration);

            if observer.snapshot_due(iteration) {
                self.step
                    .with_fields(&mut |fields| observer.snapshot(iteration, fields))?;
            }

            self.step.update_magnetic();
            self.step.update_magnetic_pml();
            self.step.update_magnetic_sources(iteration);

            self.step.update_electric();
            self.step.update_electric_pml();
            self.step.update_electric_sources(iteration);
            self.step.update_electric_dispersive();

            observer.iteration_done(iteration);
        }

        self.iteration += iterations;

        let elapsed = start_time.elapsed();
        tracing::debug!(?elapsed, "advanced");
        Ok(elapsed)
    }

    /// Runs all remaining iterations.
    pub fn run(&mut self, observer: &mut impl SolveObserver) -> Result<Duration, Error> {
        self.advance(self.iterations - self.iteration, observer)
    }

    /// Copies results back into the grid.
    pub fn finish(mut self) -> Result<(), Error> {
        self.step.finish()
    }
}

/// Backend chosen at runtime.
#[derive(Clone, Debug)]
pub enum AnyBackend {
    Cpu(cpu::CpuBackend<cpu::SingleThreaded>),
    #[cfg(feature = "rayon")]
    CpuMultiThreaded(cpu::CpuBackend<cpu::MultiThreaded>),
    #[cfg(feature = "wgpu")]
    Wgpu(self::wgpu::WgpuBackend),
}

impl Default for AnyBackend {
    fn default() -> Self {
        Self::Cpu(cpu::CpuBackend::single_threaded())
    }
}

impl From<cpu::CpuBackend<cpu::SingleThreaded>> for AnyBackend {
    fn from(value: cpu::CpuBackend<cpu::SingleThreaded>) -> Self {
        Self::Cpu(value)
    }
}

#[cfg(feature = "rayon")]
impl From<cpu::CpuBackend<cpu::MultiThreaded>> for AnyBackend {
    fn from(value: cpu::CpuBackend<cpu::MultiThreaded>) -> Self {
        Self::CpuMultiThreaded(value)
    }
}

#[cfg(feature = "wgpu")]
impl From<self::wgpu::WgpuBackend> for AnyBackend {
    fn from(value: self::wgpu::WgpuBackend) -> Self {
        Self::Wgpu(value)
    }
}

#[derive(Debug)]
pub enum AnyInstance<'a> {
    Cpu(cpu::CpuSolverInstance<'a, cpu::SingleThreaded>),
    #[cfg(feature = "rayon")]
    CpuMultiThreaded(cpu::CpuSolverInstance<'a, cpu::MultiThreaded>),
    #[cfg(feature = "wgpu")]
    Wgpu(self::wgpu::WgpuSolverInstance<'a>),
}

macro_rules! dispatch {
    ($self:ident, $instance:ident => $body:expr) => {
        match $self {
            AnyInstance::Cpu($instance) => $body,
            #[cfg(feature = "rayon")]
            AnyInstance::CpuMultiThreaded($instance) => $body,
            #[cfg(feature = "wgpu")]
            AnyInstance::Wgpu($instance) => $body,
        }
    };
}

impl<'a> LeapfrogStep for AnyInstance<'a> {
    fn store_outputs(&mut self, iteration: usize) {
        dispatch!(self, instance => instance.store_outputs(iteration))
    }

    fn update_magnetic(&mut self) {
        dispatch!(self, instance => instance.update_magnetic())
    }

    fn update_magnetic_pml(&mut self) {
        dispatch!(self, instance => instance.update_magnetic_pml())
    }

    fn update_magnetic_sources(&mut self, iteration: usize) {
        dispatch!(self, instance => instance.update_magnetic_sources(iteration))
    }

    fn update_electric(&mut self) {
        dispatch!(self, instance => instance.update_electric())
    }

    fn update_electric_pml(&mut self) {
        dispatch!(self, instance => instance.update_electric_pml())
    }

    fn update_electric_sources(&mut self, iteration: usize) {
        dispatch!(self, instance => instance.update_electric_sources(iteration))
    }

    fn update_electric_dispersive(&mut self) {
        dispatch!(self, instance => instance.update_electric_dispersive())
    }

    fn with_fields(&mut self, f: &mut dyn FnMut(&FieldArrays)) -> Result<(), Error> {
        dispatch!(self, instance => instance.with_fields(f))
    }

    fn finish(&mut self) -> Result<(), Error> {
        dispatch!(self, instance => instance.finish())
    }
}

impl SolverBackend for AnyBackend {
    type Instance<'a> = AnyInstance<'a>;

    fn name(&self) -> &'static str {
        match self {
            AnyBackend::Cpu(backend) => backend.name(),
            #[cfg(feature = "rayon")]
            AnyBackend::CpuMultiThreaded(backend) => backend.name(),
            #[cfg(feature = "wgpu")]
            AnyBackend::Wgpu(backend) => backend.name(),
        }
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        match self {
            AnyBackend::Cpu(_) => None,
            #[cfg(feature = "rayon")]
            AnyBackend::CpuMultiThreaded(_) => None,
            #[cfg(feature = "wgpu")]
            AnyBackend::Wgpu(backend) => backend.device_info(),
        }
    }

    fn create_instance<'a>(&'a self, grid: &'a mut Grid) -> Result<AnyInstance<'a>, Error> {
        Ok(match self {
            AnyBackend::Cpu(backend) => AnyInstance::Cpu(backend.create_instance(grid)?),
            #[cfg(feature = "rayon")]
            AnyBackend::CpuMultiThreaded(backend) => {
                AnyInstance::CpuMultiThreaded(backend.create_instance(grid)?)
            }
            #[cfg(feature = "wgpu")]
            AnyBackend::Wgpu(backend) => AnyInstance::Wgpu(backend.create_instance(grid)?),
        })
    }
}
