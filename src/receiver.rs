use nalgebra::Point3;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    Real,
    error::Error,
    grid::{
        FieldArrays,
        Grid,
    },
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiverDescription {
    #[serde(default)]
    pub id: Option<String>,
    /// Position in metres.
    pub position: Point3<f64>,
}

/// Samples all six field components at one node every iteration.
#[derive(Clone, derive_more::Debug)]
pub struct Receiver {
    pub id: String,
    pub origin: Point3<usize>,
    pub position: Point3<usize>,
    /// One row per iteration, in `FieldComponent` order.
    #[debug(skip)]
    pub samples: Vec<[Real; 6]>,
}

impl Receiver {
    pub fn new(grid: &Grid, index: usize, description: &ReceiverDescription) -> Result<Self, Error> {
        let id = description
            .id
            .clone()
            .unwrap_or_else(|| format!("receiver_{index}"));

        let position = description
            .position
            .coords
            .component_div(&grid.spacing)
            .map(f64::round);
        let nodes = grid.nodes();
        if (0..3).any(|axis| position[axis] < 0.0 || position[axis] >= nodes[axis] as f64) {
            return Err(Error::InvalidConfig(format!(
                "receiver '{id}' at {} lies outside the domain",
                description.position
            )));
        }
        let position: Point3<usize> = position.map(|x| x as usize).into();

        Ok(Self {
            id,
            origin: position,
            position,
            samples: vec![[0.0; 6]; grid.iterations],
        })
    }

    pub fn store(&mut self, iteration: usize, fields: &FieldArrays) {
        if let Some(sample) = self.samples.get_mut(iteration) {
            let index = fields.ex.strider().index_unchecked(&self.position);
            *sample = fields.sample(index);
        }
    }

    pub fn reset(&mut self) {
        self.samples.fill([0.0; 6]);
    }
}

impl Grid {
    /// Samples receivers and transmission lines for `iteration`. Called before
    /// any field update of that iteration.
    pub fn store_outputs(&mut self, iteration: usize) {
        for receiver in &mut self.receivers {
            receiver.store(iteration, &self.fields);
        }
        for line in &mut self.sources.transmission_lines {
            line.store_outputs(iteration);
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Point3;

    use super::ReceiverDescription;
    use crate::{
        grid::{
            Grid,
            tests::empty_model,
        },
        material::PhysicalConstants,
    };

    #[test]
    fn stores_all_components() {
        let mut description = empty_model([4, 4, 4], 3);
        description.receivers.push(ReceiverDescription {
            id: None,
            position: Point3::new(0.002, 0.001, 0.003),
        });
        let mut grid = Grid::new(&description, PhysicalConstants::SI).unwrap();
        assert_eq!(grid.receivers()[0].id, "receiver_0");

        let node = Point3::new(2, 1, 3);
        grid.fields_mut().ey[node] = 2.0;
        grid.fields_mut().hz[node] = -1.0;
        grid.store_outputs(1);

        let receiver = &grid.receivers()[0];
        assert_eq!(receiver.samples.len(), 3);
        assert_eq!(receiver.samples[0], [0.0; 6]);
        assert_eq!(receiver.samples[1], [0.0, 2.0, 0.0, 0.0, 0.0, -1.0]);
    }
}
