mod kernels;

use std::fmt::Debug;

use crate::{
    coefficients::{
        ElectricUpdate,
        UpdateCoefficients,
    },
    error::Error,
    grid::{
        Axis,
        DispersiveState,
        FieldArrays,
        FieldComponent,
        Grid,
    },
    solver::{
        LeapfrogStep,
        SolverBackend,
        cpu::kernels::{
            Accumulate,
            SlabRange,
            Stencil,
        },
    },
};

/// Defines how a single/multi-threading iterates over the z-slabs of a
/// lattice in the state update.
pub trait LatticeForEach: Send + Sync + 'static {
    const NAME: &'static str;

    /// Calls `f` with the index and contents of every slab of `slab_len`
    /// elements in `data`.
    fn for_each_slab<T, F>(&self, data: &mut [T], slab_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync;

    /// Like [`for_each_slab`](Self::for_each_slab), but walks two arrays with
    /// the same number of slabs in lockstep.
    fn for_each_slab_zip<T, U, F>(
        &self,
        a: &mut [T],
        a_slab_len: usize,
        b: &mut [U],
        b_slab_len: usize,
        f: F,
    ) where
        T: Send,
        U: Send,
        F: Fn(usize, &mut [T], &mut [U]) + Send + Sync;
}

/// Use single-threading
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleThreaded;

impl LatticeForEach for SingleThreaded {
    const NAME: &'static str = "cpu";

    fn for_each_slab<T, F>(&self, data: &mut [T], slab_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        data.chunks_mut(slab_len)
            .enumerate()
            .for_each(|(k, slab)| f(k, slab))
    }

    fn for_each_slab_zip<T, U, F>(
        &self,
        a: &mut [T],
        a_slab_len: usize,
        b: &mut [U],
        b_slab_len: usize,
        f: F,
    ) where
        T: Send,
        U: Send,
        F: Fn(usize, &mut [T], &mut [U]) + Send + Sync,
    {
        a.chunks_mut(a_slab_len)
            .zip(b.chunks_mut(b_slab_len))
            .enumerate()
            .for_each(|(k, (a, b))| f(k, a, b))
    }
}

/// Use multi-threading
#[cfg(feature = "rayon")]
#[derive(Clone, Debug)]
pub struct MultiThreaded {
    thread_pool: Option<std::sync::Arc<rayon::ThreadPool>>,
}

#[cfg(feature = "rayon")]
impl MultiThreaded {
    fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        if let Some(thread_pool) = &self.thread_pool {
            thread_pool.install(f)
        }
        else {
            f()
        }
    }
}

#[cfg(feature = "rayon")]
impl LatticeForEach for MultiThreaded {
    const NAME: &'static str = "cpu-multi-threaded";

    fn for_each_slab<T, F>(&self, data: &mut [T], slab_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        use rayon::{
            iter::{
                IndexedParallelIterator as _,
                ParallelIterator as _,
            },
            slice::ParallelSliceMut as _,
        };

        self.install(|| {
            data.par_chunks_mut(slab_len)
                .enumerate()
                .for_each(|(k, slab)| f(k, slab))
        })
    }

    fn for_each_slab_zip<T, U, F>(
        &self,
        a: &mut [T],
        a_slab_len: usize,
        b: &mut [U],
        b_slab_len: usize,
        f: F,
    ) where
        T: Send,
        U: Send,
        F: Fn(usize, &mut [T], &mut [U]) + Send + Sync,
    {
        use rayon::{
            iter::{
                IndexedParallelIterator as _,
                ParallelIterator as _,
            },
            slice::ParallelSliceMut as _,
        };

        self.install(|| {
            a.par_chunks_mut(a_slab_len)
                .zip(b.par_chunks_mut(b_slab_len))
                .enumerate()
                .for_each(|(k, (a, b))| f(k, a, b))
        })
    }
}

#[cfg(feature = "rayon")]
impl MultiThreaded {
    /// Use default number of threads (see [`rayon::current_num_threads`])
    pub fn from_default_thread_pool() -> Self {
        Self { thread_pool: None }
    }

    pub fn from_num_threads(num_threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        Ok(Self::from_thread_pool(
            rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()?,
        ))
    }

    pub fn from_thread_pool(thread_pool: rayon::ThreadPool) -> Self {
        Self {
            thread_pool: Some(std::sync::Arc::new(thread_pool)),
        }
    }

    /// Use max number of threads (see [`rayon::max_num_threads`])
    pub fn max_threads() -> Result<Self, rayon::ThreadPoolBuildError> {
        Self::from_num_threads(rayon::max_num_threads())
    }
}

#[cfg(feature = "rayon")]
impl Default for MultiThreaded {
    fn default() -> Self {
        Self::from_default_thread_pool()
    }
}

#[cfg(feature = "rayon")]
impl CpuBackend<MultiThreaded> {
    pub fn multi_threaded(num_threads: Option<usize>) -> Result<Self, rayon::ThreadPoolBuildError> {
        let threading = if let Some(num_threads) = num_threads {
            MultiThreaded::from_num_threads(num_threads)?
        }
        else {
            MultiThreaded::from_default_thread_pool()
        };

        Ok(Self { threading })
    }

    pub fn num_threads(&self) -> usize {
        self.threading
            .thread_pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, |thread_pool| {
                thread_pool.current_num_threads()
            })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CpuBackend<Threading = SingleThreaded> {
    /// Whether to use single-threading or multi-threading
    pub threading: Threading,
}

impl Default for CpuBackend<SingleThreaded> {
    fn default() -> Self {
        Self::single_threaded()
    }
}

impl<Threading> CpuBackend<Threading> {
    pub fn new(threading: Threading) -> Self {
        Self { threading }
    }
}

impl CpuBackend<SingleThreaded> {
    pub fn single_threaded() -> Self {
        Self {
            threading: SingleThreaded,
        }
    }
}

impl<Threading> SolverBackend for CpuBackend<Threading>
where
    Threading: LatticeForEach + Debug,
{
    type Instance<'a>
        = CpuSolverInstance<'a, Threading>
    where
        Self: 'a;

    fn name(&self) -> &'static str {
        Threading::NAME
    }

    fn create_instance<'a>(&'a self, grid: &'a mut Grid) -> Result<Self::Instance<'a>, Error> {
        let coefficients = grid.coefficients_or_err()?.clone();
        let electric_update = coefficients.electric_update();
        if electric_update != ElectricUpdate::Standard && grid.dispersive.is_none() {
            return Err(Error::NotPrepared);
        }

        tracing::debug!(
            backend = Threading::NAME,
            ?electric_update,
            num_pmls = grid.pmls.len(),
            "created solver instance"
        );

        Ok(CpuSolverInstance {
            grid,
            threading: &self.threading,
            coefficients,
            electric_update,
        })
    }
}

/// Updates the grid's arrays in place.
#[derive(Debug)]
pub struct CpuSolverInstance<'a, Threading = SingleThreaded> {
    grid: &'a mut Grid,
    threading: &'a Threading,
    coefficients: UpdateCoefficients,
    electric_update: ElectricUpdate,
}

impl<'a, Threading> CpuSolverInstance<'a, Threading>
where
    Threading: LatticeForEach,
{
    fn update_electric_with(&mut self, update: ElectricUpdate) {
        let grid = &mut *self.grid;
        let cells = grid.cells;
        let strides = *grid.ids.strider().strides();
        let slab_len = strides.z;
        let ids = grid.ids.as_slice();
        let table = &self.coefficients.electric;

        let FieldArrays {
            ex,
            ey,
            ez,
            hx,
            hy,
            hz,
        } = &mut grid.fields;
        let h = [hx.as_slice(), hy.as_slice(), hz.as_slice()];
        let e = [ex.as_mut_slice(), ey.as_mut_slice(), ez.as_mut_slice()];

        let dispersive = match (
            grid.dispersive.as_mut(),
            self.coefficients.dispersive.as_ref(),
        ) {
            (Some(state), Some(dispersive)) if update != ElectricUpdate::Standard => {
                Some((state, dispersive))
            }
            _ => None,
        };

        let Some((state, dispersive)) = dispersive
        else {
            for (axis, field) in e.into_iter().enumerate() {
                let component = FieldComponent::electric(Axis::from_index(axis));
                let stencil = Stencil::new(component, h, &cells, strides, ids, table);
                self.threading.for_each_slab(field, slab_len, |k, slab| {
                    kernels::update_standard(&stencil, k, slab)
                });
            }
            return;
        };

        let poles = state.poles;
        let DispersiveState { tx, ty, tz, .. } = state;
        let accumulators = [&mut **tx, &mut **ty, &mut **tz];

        for (axis, (field, accumulators)) in e.into_iter().zip(accumulators).enumerate() {
            let component = FieldComponent::electric(Axis::from_index(axis));
            let stencil = Stencil::new(component, h, &cells, strides, ids, table);
            match update {
                ElectricUpdate::SinglePole => {
                    self.threading.for_each_slab_zip(
                        field,
                        slab_len,
                        accumulators,
                        slab_len,
                        |k, slab, accumulators| {
                            kernels::update_single_pole_a(
                                &stencil,
                                dispersive,
                                k,
                                slab,
                                accumulators,
                            )
                        },
                    )
                }
                _ => {
                    self.threading.for_each_slab_zip(
                        field,
                        slab_len,
                        accumulators,
                        slab_len * poles,
                        |k, slab, accumulators| {
                            kernels::update_multi_pole_a(
                                &stencil,
                                dispersive,
                                poles,
                                k,
                                slab,
                                accumulators,
                            )
                        },
                    )
                }
            }
        }
    }

    fn update_electric_dispersive_with(&mut self, update: ElectricUpdate) {
        if update == ElectricUpdate::Standard {
            return;
        }

        let grid = &mut *self.grid;
        let (Some(state), Some(dispersive)) = (
            grid.dispersive.as_mut(),
            self.coefficients.dispersive.as_ref(),
        )
        else {
            return;
        };

        let cells = grid.cells;
        let strides = *grid.ids.strider().strides();
        let slab_len = strides.z;
        let ids = grid.ids.as_slice();
        let fields = &grid.fields;
        let e = [fields.ex.as_slice(), fields.ey.as_slice(), fields.ez.as_slice()];

        let poles = state.poles;
        let DispersiveState { tx, ty, tz, .. } = state;
        let accumulators = [&mut **tx, &mut **ty, &mut **tz];

        for (axis, (field, accumulators)) in e.into_iter().zip(accumulators).enumerate() {
            let component = FieldComponent::electric(Axis::from_index(axis));
            let accumulate = Accumulate {
                component: component.index(),
                range: SlabRange::new(component, &cells, strides),
                ids,
                dispersive,
                field,
            };
            match update {
                ElectricUpdate::SinglePole => {
                    self.threading
                        .for_each_slab(accumulators, slab_len, |k, accumulators| {
                            kernels::update_single_pole_b(&accumulate, k, accumulators)
                        })
                }
                _ => {
                    self.threading
                        .for_each_slab(accumulators, slab_len * poles, |k, accumulators| {
                            kernels::update_multi_pole_b(&accumulate, poles, k, accumulators)
                        })
                }
            }
        }
    }
}

impl<'a, Threading> LeapfrogStep for CpuSolverInstance<'a, Threading>
where
    Threading: LatticeForEach,
{
    fn store_outputs(&mut self, iteration: usize) {
        self.grid.store_outputs(iteration);
    }

    fn update_magnetic(&mut self) {
        let grid = &mut *self.grid;
        let cells = grid.cells;
        let strides = *grid.ids.strider().strides();
        let ids = grid.ids.as_slice();
        let table = &self.coefficients.magnetic;

        let FieldArrays {
            ex,
            ey,
            ez,
            hx,
            hy,
            hz,
        } = &mut grid.fields;
        let e = [ex.as_slice(), ey.as_slice(), ez.as_slice()];
        let h = [hx.as_mut_slice(), hy.as_mut_slice(), hz.as_mut_slice()];

        for (axis, field) in h.into_iter().enumerate() {
            let component = FieldComponent::magnetic(Axis::from_index(axis));
            let stencil = Stencil::new(component, e, &cells, strides, ids, table);
            self.threading.for_each_slab(field, strides.z, |k, slab| {
                kernels::update_standard(&stencil, k, slab)
            });
        }
    }

    fn update_magnetic_pml(&mut self) {
        let grid = &mut *self.grid;
        for pml in &mut grid.pmls {
            pml.update_magnetic(&mut grid.fields, &grid.ids, &self.coefficients.magnetic);
        }
    }

    fn update_magnetic_sources(&mut self, iteration: usize) {
        let grid = &mut *self.grid;
        grid.sources.update_magnetic(
            iteration,
            grid.dt,
            &mut grid.fields,
            &grid.ids,
            &self.coefficients,
            &grid.spacing,
        );
    }

    fn update_electric(&mut self) {
        self.update_electric_with(self.electric_update);
    }

    fn update_electric_pml(&mut self) {
        let grid = &mut *self.grid;
        for pml in &mut grid.pmls {
            pml.update_electric(&mut grid.fields, &grid.ids, &self.coefficients.electric);
        }
    }

    fn update_electric_sources(&mut self, iteration: usize) {
        let grid = &mut *self.grid;
        grid.sources.update_electric(
            iteration,
            grid.dt,
            &mut grid.fields,
            &grid.ids,
            &self.coefficients,
            &grid.spacing,
        );
    }

    fn update_electric_dispersive(&mut self) {
        self.update_electric_dispersive_with(self.electric_update);
    }

    fn with_fields(&mut self, f: &mut dyn FnMut(&FieldArrays)) -> Result<(), Error> {
        f(&self.grid.fields);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fmt::Debug;

    use nalgebra::Point3;

    use super::{
        CpuBackend,
        LatticeForEach,
    };
    use crate::{
        coefficients::ElectricUpdate,
        config::ModelDescription,
        grid::{
            Axis,
            FieldArrays,
            Grid,
            geometry::GeometryCommand,
            tests::empty_model,
        },
        material::{
            Material,
            Pole,
        },
        model::tests::prepared_grid,
        pml::{
            PmlDescription,
            PmlThickness,
        },
        receiver::ReceiverDescription,
        solver::{
            LeapfrogStep,
            Solver,
            SolverBackend,
        },
        source::{
            SourceDescription,
            SourceKind,
        },
        waveform::{
            Waveform,
            WaveformShape,
        },
    };

    /// A Hertzian dipole at the centre of a free-space cube and a receiver
    /// three cells away from it.
    pub fn dipole_model(cells: usize, iterations: usize) -> ModelDescription {
        let mut description = empty_model([cells; 3], iterations);
        let centre = cells as f64 / 2.0 * 1e-3;
        description
            .waveforms
            .push(Waveform::new("pulse", WaveformShape::Ricker, 1e10));
        description.sources.push(SourceDescription {
            id: None,
            kind: SourceKind::HertzianDipole,
            polarisation: Axis::Z,
            position: Point3::new(centre, centre, centre),
            waveform: "pulse".to_owned(),
            start: 0.0,
            stop: None,
        });
        description.receivers.push(ReceiverDescription {
            id: None,
            position: Point3::new(centre + 3e-3, centre, centre),
        });
        description
    }

    pub fn run_to_end<B: SolverBackend>(backend: &B, grid: &mut Grid) {
        let iterations = grid.iterations();
        let instance = backend.create_instance(grid).unwrap();
        let mut solver = Solver::new(instance, iterations);
        solver.run(&mut ()).unwrap();
        solver.finish().unwrap();
    }

    fn electric_energy(fields: &FieldArrays) -> f64 {
        [&fields.ex, &fields.ey, &fields.ez]
            .iter()
            .flat_map(|lattice| lattice.as_slice())
            .map(|value| (*value as f64).powi(2))
            .sum()
    }

    #[test]
    fn fields_stay_zero_without_sources() {
        let mut grid = prepared_grid(&empty_model([8, 8, 8], 20));
        grid.fields_mut().zero();
        run_to_end(&CpuBackend::single_threaded(), &mut grid);
        assert!(grid.fields().is_zero());
    }

    #[test]
    fn longer_runs_only_append() {
        let backend = CpuBackend::single_threaded();

        let mut short = prepared_grid(&dipole_model(12, 30));
        run_to_end(&backend, &mut short);
        let mut long = prepared_grid(&dipole_model(12, 60));
        run_to_end(&backend, &mut long);

        let short = &short.receivers()[0].samples;
        let long = &long.receivers()[0].samples;
        assert_eq!(short.len(), 30);
        assert_eq!(long.len(), 60);
        assert_eq!(short[..], long[..30]);
        assert!(short.iter().any(|sample| sample[2] != 0.0));
    }

    fn debye_model() -> ModelDescription {
        let mut description = dipole_model(10, 40);
        description.materials.push(Material {
            relative_permittivity: 4.0,
            poles: vec![Pole::Debye {
                delta_er: 10.0,
                tau: 1e-10,
            }],
            ..Material::new("wet_soil")
        });
        description.geometry.push(GeometryCommand::Box {
            lower: Point3::new(0.0, 0.0, 0.0),
            upper: Point3::new(0.01, 0.01, 0.004),
            material: "wet_soil".to_owned(),
            averaging: true,
        });
        description
    }

    fn run_with_update<T: LatticeForEach + Debug>(
        backend: &CpuBackend<T>,
        grid: &mut Grid,
        update: ElectricUpdate,
    ) {
        let iterations = grid.iterations();
        let mut instance = backend.create_instance(grid).unwrap();
        for iteration in 0..iterations {
            instance.store_outputs(iteration);
            instance.update_magnetic();
            instance.update_magnetic_pml();
            instance.update_magnetic_sources(iteration);
            instance.update_electric_with(update);
            instance.update_electric_pml();
            instance.update_electric_sources(iteration);
            instance.update_electric_dispersive_with(update);
        }
    }

    #[test]
    fn single_pole_kernel_matches_multi_pole_kernel() {
        let backend = CpuBackend::single_threaded();

        let mut single = prepared_grid(&debye_model());
        assert_eq!(
            single.coefficients().unwrap().electric_update(),
            ElectricUpdate::SinglePole
        );
        run_with_update(&backend, &mut single, ElectricUpdate::SinglePole);

        let mut multi = prepared_grid(&debye_model());
        run_with_update(&backend, &mut multi, ElectricUpdate::MultiPole { poles: 1 });

        assert_eq!(single.fields().ez.as_slice(), multi.fields().ez.as_slice());
        assert_eq!(single.fields().hx.as_slice(), multi.fields().hx.as_slice());
        assert_eq!(
            single.dispersive_state().unwrap().tz,
            multi.dispersive_state().unwrap().tz
        );
        assert!(
            single
                .dispersive_state()
                .unwrap()
                .tz
                .iter()
                .any(|t| t.re != 0.0)
        );
    }

    #[test]
    fn two_half_poles_match_one_pole() {
        let backend = CpuBackend::single_threaded();

        let mut one = prepared_grid(&debye_model());
        run_to_end(&backend, &mut one);

        let mut description = debye_model();
        let soil = description
            .materials
            .iter_mut()
            .find(|material| material.name == "wet_soil")
            .unwrap();
        soil.poles = vec![
            Pole::Debye {
                delta_er: 5.0,
                tau: 1e-10,
            };
            2
        ];
        let mut two = prepared_grid(&description);
        assert_eq!(two.coefficients().unwrap().max_poles, 2);
        assert_eq!(
            two.coefficients().unwrap().electric_update(),
            ElectricUpdate::MultiPole { poles: 2 }
        );
        run_to_end(&backend, &mut two);
        assert!(
            two
                .dispersive_state()
                .unwrap()
                .tz
                .iter()
                .any(|t| t.re != 0.0)
        );

        let one = &one.receivers()[0].samples;
        let two = &two.receivers()[0].samples;
        let peak = one
            .iter()
            .flatten()
            .fold(0.0f32, |peak, value| peak.max(value.abs()));
        assert!(peak > 0.0);
        for (a, b) in one.iter().flatten().zip(two.iter().flatten()) {
            assert!((a - b).abs() <= 1e-4 * peak, "{a} vs {b}");
        }
    }

    #[test]
    fn dispersive_material_changes_the_response() {
        let backend = CpuBackend::single_threaded();

        let mut free = prepared_grid(&dipole_model(10, 40));
        run_to_end(&backend, &mut free);
        let mut soil = prepared_grid(&debye_model());
        run_to_end(&backend, &mut soil);

        let free = &free.receivers()[0].samples;
        let soil = &soil.receivers()[0].samples;
        assert_ne!(free, soil);
    }

    #[test]
    fn pml_absorbs_outgoing_waves() {
        let backend = CpuBackend::single_threaded();

        let mut closed = prepared_grid(&dipole_model(24, 300));
        run_to_end(&backend, &mut closed);

        let mut description = dipole_model(24, 300);
        description.pml = PmlDescription {
            thickness: PmlThickness::uniform(6),
            ..Default::default()
        };
        let mut open = prepared_grid(&description);
        assert_eq!(open.pmls().len(), 6);
        run_to_end(&backend, &mut open);

        // The direct pulse has passed the receiver after about 130 iterations.
        let late_energy = |grid: &Grid| -> f64 {
            grid.receivers()[0].samples[200..]
                .iter()
                .flat_map(|sample| &sample[..3])
                .map(|value| (*value as f64).powi(2))
                .sum()
        };
        let closed_late = late_energy(&closed);
        let open_late = late_energy(&open);
        assert!(closed_late > 0.0);
        assert!(open_late < 0.1 * closed_late, "{open_late} vs {closed_late}");

        let closed = electric_energy(closed.fields());
        let open = electric_energy(open.fields());
        assert!(closed > 0.0);
        assert!(open < 0.1 * closed, "{open} vs {closed}");
    }

    #[cfg(feature = "rayon")]
    #[test]
    fn multi_threaded_matches_single_threaded() {
        let mut single = prepared_grid(&debye_model());
        run_to_end(&CpuBackend::single_threaded(), &mut single);

        let backend = CpuBackend::multi_threaded(Some(3)).unwrap();
        assert_eq!(backend.num_threads(), 3);
        let mut multi = prepared_grid(&debye_model());
        run_to_end(&backend, &mut multi);

        assert_eq!(single.receivers()[0].samples, multi.receivers()[0].samples);
        assert_eq!(single.fields().ez.as_slice(), multi.fields().ez.as_slice());
    }
}
