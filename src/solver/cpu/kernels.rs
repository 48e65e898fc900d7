//! Per-slab update kernels.
//!
//! Each kernel updates one field component over the nodes of one z-slab
//! that lie inside the component's update range. Slabs are disjoint, so the
//! kernels can run on all slabs in parallel.

use std::ops::Range;

use nalgebra::{
    Point3,
    Vector3,
    Vector4,
};

use crate::{
    Complex,
    Real,
    coefficients::{
        CURL,
        CoefficientTable,
        LOSS,
        SOURCE,
    },
    grid::FieldComponent,
    material::MaterialId,
};

/// Nodes of an update range, visited one z-slab at a time.
#[derive(Clone, Debug)]
pub struct SlabRange {
    range: Range<Point3<usize>>,
    strides: Vector4<usize>,
}

impl SlabRange {
    pub fn new(component: FieldComponent, cells: &Vector3<usize>, strides: Vector4<usize>) -> Self {
        Self {
            range: component.update_range(cells),
            strides,
        }
    }

    /// Yields `(local, global)` indices of the nodes in slab `k`. `local` is
    /// relative to the start of the slab.
    pub fn slab_indices(&self, k: usize) -> impl Iterator<Item = (usize, usize)> + use<> {
        let Range { start, end } = self.range.clone();
        let ys = if (start.z..end.z).contains(&k) {
            start.y..end.y
        }
        else {
            0..0
        };
        let xs = start.x..end.x;
        let (stride_y, offset) = (self.strides.y, k * self.strides.z);

        ys.flat_map(move |y| {
            xs.clone().map(move |x| {
                let local = x + y * stride_y;
                (local, local + offset)
            })
        })
    }
}

/// A finite difference of one field along one axis, and the coefficient
/// column it is scaled with.
#[derive(Clone, Copy, Debug)]
struct Difference<'a> {
    field: &'a [Real],
    stride: usize,
    column: usize,
}

/// Curl term of one field component.
///
/// For `E_a` with `(a, b, c)` cyclic:
/// `CB_b (H_c - H_c[-b]) - CB_c (H_b - H_b[-c])`.
///
/// For `H_a`:
/// `DB_c (E_b[+c] - E_b) - DB_b (E_c[+b] - E_c)`.
#[derive(Clone, Debug)]
pub struct Stencil<'a> {
    component: usize,
    electric: bool,
    plus: Difference<'a>,
    minus: Difference<'a>,
    pub range: SlabRange,
    ids: &'a [[MaterialId; 6]],
    pub table: &'a CoefficientTable<Real>,
}

impl<'a> Stencil<'a> {
    /// `sources` are the three components of the other field.
    pub fn new(
        component: FieldComponent,
        sources: [&'a [Real]; 3],
        cells: &Vector3<usize>,
        strides: Vector4<usize>,
        ids: &'a [[MaterialId; 6]],
        table: &'a CoefficientTable<Real>,
    ) -> Self {
        let a = component.axis().index();
        let (b, c) = ((a + 1) % 3, (a + 2) % 3);
        let along = |field: usize, axis: usize| {
            Difference {
                field: sources[field],
                stride: strides[axis],
                column: CURL[axis],
            }
        };

        let electric = component.is_electric();
        let (plus, minus) = if electric {
            (along(c, b), along(b, c))
        }
        else {
            (along(b, c), along(c, b))
        };

        Self {
            component: component.index(),
            electric,
            plus,
            minus,
            range: SlabRange::new(component, cells, strides),
            ids,
            table,
        }
    }

    #[inline(always)]
    fn difference(&self, difference: &Difference, index: usize) -> Real {
        if self.electric {
            difference.field[index] - difference.field[index - difference.stride]
        }
        else {
            difference.field[index + difference.stride] - difference.field[index]
        }
    }

    #[inline(always)]
    pub fn material(&self, index: usize) -> MaterialId {
        self.ids[index][self.component]
    }

    #[inline(always)]
    pub fn curl(&self, index: usize, row: &[Real]) -> Real {
        row[self.plus.column] * self.difference(&self.plus, index)
            - row[self.minus.column] * self.difference(&self.minus, index)
    }
}

pub fn update_standard(stencil: &Stencil, k: usize, slab: &mut [Real]) {
    for (local, index) in stencil.range.slab_indices(k) {
        let row = stencil.table.row(stencil.material(index));
        slab[local] = row[LOSS] * slab[local] + stencil.curl(index, row);
    }
}

/// Phase A with one accumulator per node.
pub fn update_single_pole_a(
    stencil: &Stencil,
    dispersive: &CoefficientTable<Complex>,
    k: usize,
    slab: &mut [Real],
    accumulators: &mut [Complex],
) {
    for (local, index) in stencil.range.slab_indices(k) {
        let id = stencil.material(index);
        let row = stencil.table.row(id);
        let pole = dispersive.row(id);

        let e = slab[local];
        let t = &mut accumulators[local];
        let phi = pole[0].re * t.re;
        *t = pole[1] * *t + pole[2] * e;

        slab[local] = row[LOSS] * e + stencil.curl(index, row) - row[SOURCE] * phi;
    }
}

/// Phase A with `poles` accumulators per node.
pub fn update_multi_pole_a(
    stencil: &Stencil,
    dispersive: &CoefficientTable<Complex>,
    poles: usize,
    k: usize,
    slab: &mut [Real],
    accumulators: &mut [Complex],
) {
    for (local, index) in stencil.range.slab_indices(k) {
        let id = stencil.material(index);
        let row = stencil.table.row(id);
        let coefficients = dispersive.row(id);

        let e = slab[local];
        let mut phi = 0.0;
        for (t, pole) in accumulators[local * poles..(local + 1) * poles]
            .iter_mut()
            .zip(coefficients.chunks_exact(3))
        {
            phi += pole[0].re * t.re;
            *t = pole[1] * *t + pole[2] * e;
        }

        slab[local] = row[LOSS] * e + stencil.curl(index, row) - row[SOURCE] * phi;
    }
}

/// What phase B needs to know about a component.
#[derive(Clone, Debug)]
pub struct Accumulate<'a> {
    pub component: usize,
    pub range: SlabRange,
    pub ids: &'a [[MaterialId; 6]],
    pub dispersive: &'a CoefficientTable<Complex>,
    pub field: &'a [Real],
}

/// Phase B with one accumulator per node.
pub fn update_single_pole_b(accumulate: &Accumulate, k: usize, accumulators: &mut [Complex]) {
    for (local, index) in accumulate.range.slab_indices(k) {
        let pole = accumulate
            .dispersive
            .row(accumulate.ids[index][accumulate.component]);
        accumulators[local] -= pole[2] * accumulate.field[index];
    }
}

/// Phase B with `poles` accumulators per node.
pub fn update_multi_pole_b(
    accumulate: &Accumulate,
    poles: usize,
    k: usize,
    accumulators: &mut [Complex],
) {
    for (local, index) in accumulate.range.slab_indices(k) {
        let coefficients = accumulate
            .dispersive
            .row(accumulate.ids[index][accumulate.component]);
        let e = accumulate.field[index];
        for (t, pole) in accumulators[local * poles..(local + 1) * poles]
            .iter_mut()
            .zip(coefficients.chunks_exact(3))
        {
            *t -= pole[2] * e;
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{
        Point3,
        Vector3,
    };

    use super::SlabRange;
    use crate::{
        grid::FieldComponent,
        lattice::Strider,
    };

    #[test]
    fn slab_indices_cover_the_update_range() {
        let cells = Vector3::new(3, 4, 5);
        let strider = Strider::new(&cells.add_scalar(1));
        let range = SlabRange::new(FieldComponent::Ez, &cells, *strider.strides());

        let mut visited = vec![];
        for k in 0..=cells.z {
            for (local, index) in range.slab_indices(k) {
                assert_eq!(index - local, k * strider.slab_len());
                visited.push(strider.point_unchecked(index));
            }
        }

        let expected = strider
            .iter(Point3::new(1, 1, 0)..Point3::new(3, 4, 5))
            .map(|(_, point)| point)
            .collect::<Vec<_>>();
        assert_eq!(visited, expected);
    }
}
