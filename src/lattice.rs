//! Flat storage for 3D arrays.
//!
//! All arrays in the grid (fields, edge IDs, solid, rigid flags) are stored in
//! x-fastest order. The GPU kernels use the same layout, so a [`Strider`] is
//! all that is needed to translate between points and indices on both sides.

use std::ops::{
    Bound,
    Index,
    IndexMut,
    Range,
    RangeBounds,
};

use nalgebra::{
    Point3,
    Vector3,
    Vector4,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Strider {
    strides: Vector4<usize>,
    size: Vector3<usize>,
}

impl Strider {
    pub fn new(size: &Vector3<usize>) -> Self {
        Self {
            strides: strides_for_size(size),
            size: *size,
        }
    }

    pub fn point_unchecked(&self, mut index: usize) -> Point3<usize> {
        let z = index / self.strides.z;
        index %= self.strides.z;
        let y = index / self.strides.y;
        index %= self.strides.y;
        let x = index / self.strides.x;
        Point3::new(x, y, z)
    }

    #[inline(always)]
    pub fn index_unchecked(&self, point: &Point3<usize>) -> usize {
        point.coords.dot(&self.strides.xyz())
    }

    pub fn index(&self, point: &Point3<usize>) -> Option<usize> {
        self.is_inside(point).then(|| self.index_unchecked(point))
    }

    /// Strides along x, y, z. The `w` component is the total length.
    pub fn strides(&self) -> &Vector4<usize> {
        &self.strides
    }

    pub fn size(&self) -> &Vector3<usize> {
        &self.size
    }

    pub fn len(&self) -> usize {
        self.strides.w
    }

    pub fn is_empty(&self) -> bool {
        self.strides.w == 0
    }

    /// Number of elements in one z-slab.
    pub fn slab_len(&self) -> usize {
        self.strides.z
    }

    pub fn iter(&self, range: impl RangeBounds<Point3<usize>>) -> StriderIter {
        StriderIter {
            points: iter_points(range, self.size),
            strider: *self,
        }
    }

    pub fn is_inside(&self, point: &Point3<usize>) -> bool {
        point.x < self.size.x && point.y < self.size.y && point.z < self.size.z
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StriderIter {
    points: PointIter,
    strider: Strider,
}

impl Iterator for StriderIter {
    type Item = (usize, Point3<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.points.next()?;
        let index = self.strider.index_unchecked(&point);
        Some((index, point))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.points.size_hint()
    }
}

impl ExactSizeIterator for StriderIter where PointIter: ExactSizeIterator {}

pub fn strides_for_size(size: &Vector3<usize>) -> Vector4<usize> {
    let mut strides = Vector4::zeros();
    strides.x = 1;
    strides.y = strides.x * size.x;
    strides.z = strides.y * size.y;
    strides.w = strides.z * size.z;
    strides
}

/// A 3D array addressed through a [`Strider`].
#[derive(Clone, derive_more::Debug)]
pub struct Lattice<T> {
    strider: Strider,
    #[debug(skip)]
    data: Box<[T]>,
}

impl<T> Lattice<T>
where
    T: Clone,
{
    pub fn from_value(size: &Vector3<usize>, value: T) -> Self {
        let strider = Strider::new(size);
        Self {
            strider,
            data: vec![value; strider.len()].into_boxed_slice(),
        }
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }
}

impl<T> Lattice<T>
where
    T: Clone + Default,
{
    pub fn from_default(size: &Vector3<usize>) -> Self {
        Self::from_value(size, T::default())
    }
}

impl<T> Lattice<T> {
    pub fn strider(&self) -> &Strider {
        &self.strider
    }

    pub fn size(&self) -> &Vector3<usize> {
        self.strider.size()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, point: &Point3<usize>) -> Option<&T> {
        let index = self.strider.index(point)?;
        Some(&self.data[index])
    }

    pub fn get_mut(&mut self, point: &Point3<usize>) -> Option<&mut T> {
        let index = self.strider.index(point)?;
        Some(&mut self.data[index])
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn iter(
        &self,
        range: impl RangeBounds<Point3<usize>>,
    ) -> impl Iterator<Item = (Point3<usize>, &T)> {
        self.strider
            .iter(range)
            .map(|(index, point)| (point, &self.data[index]))
    }
}

impl<T> Index<usize> for Lattice<T> {
    type Output = T;

    #[inline(always)]
    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index]
    }
}

impl<T> IndexMut<usize> for Lattice<T> {
    #[inline(always)]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl<T> Index<Point3<usize>> for Lattice<T> {
    type Output = T;

    fn index(&self, point: Point3<usize>) -> &Self::Output {
        &self.data[self.strider.index_unchecked(&point)]
    }
}

impl<T> IndexMut<Point3<usize>> for Lattice<T> {
    fn index_mut(&mut self, point: Point3<usize>) -> &mut Self::Output {
        let index = self.strider.index_unchecked(&point);
        &mut self.data[index]
    }
}

pub fn iter_points(range: impl RangeBounds<Point3<usize>>, size: Vector3<usize>) -> PointIter {
    let Range { start, end } = normalize_point_bounds(range, size);

    let empty = (0..3).any(|axis| start[axis] >= end[axis]);

    PointIter {
        x0: start.coords,
        x1: end.coords,
        x: (!empty).then_some(start.coords),
    }
}

pub fn normalize_point_bounds(
    range: impl RangeBounds<Point3<usize>>,
    size: Vector3<usize>,
) -> Range<Point3<usize>> {
    let start = match range.start_bound() {
        Bound::Included(start) => *start,
        Bound::Excluded(start) => start + Vector3::repeat(1),
        Bound::Unbounded => Point3::origin(),
    };

    let end = match range.end_bound() {
        Bound::Included(end) => end + Vector3::repeat(1),
        Bound::Excluded(end) => *end,
        Bound::Unbounded => size.into(),
    };

    let end = start
        .coords
        .zip_map(&end.coords, |x0, x1| x0.max(x1))
        .into();

    Range { start, end }
}

/// Iterates over all points in a box, x fastest.
#[derive(Clone, Copy, Debug)]
pub struct PointIter {
    x0: Vector3<usize>,
    x1: Vector3<usize>,
    x: Option<Vector3<usize>>,
}

impl Iterator for PointIter {
    type Item = Point3<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = |mut x_n: Vector3<usize>| {
            x_n.x += 1;
            if x_n.x >= self.x1.x {
                x_n.x = self.x0.x;
                x_n.y += 1;
                if x_n.y >= self.x1.y {
                    x_n.y = self.x0.y;
                    x_n.z += 1;
                    if x_n.z >= self.x1.z {
                        return None;
                    }
                }
            }
            Some(x_n)
        };

        let x = self.x?;
        self.x = next(x);
        Some(Point3::from(x))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.x.map_or(0, |x| {
            let dx = self.x1 - self.x0;
            (self.x1.z - x.z - 1) * dx.y * dx.x + (self.x1.y - x.y - 1) * dx.x + (self.x1.x - x.x)
        });
        (n, Some(n))
    }
}

impl ExactSizeIterator for PointIter {}

#[cfg(test)]
mod tests {
    use nalgebra::{
        Point3,
        Vector3,
    };

    use super::{
        Lattice,
        Strider,
        iter_points,
    };

    #[test]
    fn it_iters_inclusive() {
        let x0 = Point3::new(1, 2, 3);
        let x1 = Point3::new(2, 3, 4);
        let points = iter_points(x0..=x1, x1.coords).collect::<Vec<_>>();
        assert_eq!(
            points,
            vec![
                Point3::new(1, 2, 3),
                Point3::new(2, 2, 3),
                Point3::new(1, 3, 3),
                Point3::new(2, 3, 3),
                Point3::new(1, 2, 4),
                Point3::new(2, 2, 4),
                Point3::new(1, 3, 4),
                Point3::new(2, 3, 4),
            ]
        );
    }

    #[test]
    fn empty_range_yields_nothing() {
        let x0 = Point3::new(1, 1, 1);
        let x1 = Point3::new(1, 3, 3);
        assert_eq!(iter_points(x0..x1, Vector3::repeat(4)).count(), 0);
    }

    #[test]
    fn size_hint_counts_remaining_points() {
        let mut points = iter_points(.., Vector3::new(3, 2, 2));
        assert_eq!(points.len(), 12);
        points.next();
        points.next();
        assert_eq!(points.len(), 10);
        assert_eq!(points.count(), 10);
    }

    #[test]
    fn strider_round_trips_points() {
        let strider = Strider::new(&Vector3::new(4, 5, 6));
        assert_eq!(strider.len(), 120);
        assert_eq!(strider.slab_len(), 20);
        let point = Point3::new(3, 2, 5);
        let index = strider.index(&point).unwrap();
        assert_eq!(index, 3 + 4 * 2 + 20 * 5);
        assert_eq!(strider.point_unchecked(index), point);
        assert_eq!(strider.index(&Point3::new(4, 0, 0)), None);
    }

    #[test]
    fn lattice_uses_x_fastest_layout() {
        let mut lattice = Lattice::from_default(&Vector3::new(2, 2, 2));
        lattice[Point3::new(1, 0, 0)] = 1;
        lattice[Point3::new(0, 0, 1)] = 10;
        lattice[Point3::new(1, 0, 1)] = 11;
        assert_eq!(lattice.as_slice(), &[0, 1, 0, 0, 10, 11, 0, 0]);
        assert_eq!(lattice[Point3::new(1, 0, 1)], 11);
    }
}
