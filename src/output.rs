//! Results of a model run.

use std::{
    borrow::Cow,
    io::Write,
    path::Path,
    time::Duration,
};

use chrono::{
    DateTime,
    Local,
};
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
    error::Error,
    grid::Grid,
    model::RunIndex,
};

pub const MAGIC: &str = "gpr-fdtd-output";
pub const VERSION: u64 = 0;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelOutput {
    pub magic: Cow<'static, str>,
    pub version: u64,
    pub metadata: Metadata,
    pub receivers: Vec<ReceiverOutput>,
    pub transmission_lines: Vec<TransmissionLineOutput>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub title: String,
    pub input_file: Option<String>,
    pub model_run: usize,
    pub model_runs: usize,
    pub iterations: usize,
    pub dt: f64,
    pub cells: Vector3<usize>,
    pub spacing: Vector3<f64>,
    /// Wall-clock time of the leapfrog loop.
    pub solve_time: Duration,
    pub backend: Cow<'static, str>,
    pub timestamp: DateTime<Local>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiverOutput {
    pub id: String,
    /// Position in metres.
    pub position: Point3<f64>,
    /// One row per iteration: `Ex, Ey, Ez, Hx, Hy, Hz`.
    pub samples: Vec<[Real; 6]>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransmissionLineOutput {
    pub id: String,
    pub position: Point3<f64>,
    pub incident_voltage: Vec<Real>,
    pub incident_current: Vec<Real>,
    pub total_voltage: Vec<Real>,
    pub total_current: Vec<Real>,
}

impl ModelOutput {
    /// Collects the outputs of a finished run.
    pub fn from_grid(
        grid: &Grid,
        run: RunIndex,
        solve_time: Duration,
        backend: &'static str,
    ) -> Self {
        let metres = |node: &Point3<usize>| -> Point3<f64> {
            node.coords
                .map(|x| x as f64)
                .component_mul(grid.spacing())
                .into()
        };

        let receivers = grid
            .receivers()
            .iter()
            .map(|receiver| {
                ReceiverOutput {
                    id: receiver.id.clone(),
                    position: metres(&receiver.position),
                    samples: receiver.samples.clone(),
                }
            })
            .collect();

        let transmission_lines = grid
            .sources()
            .transmission_lines
            .iter()
            .map(|line| {
                TransmissionLineOutput {
                    id: line.source.id.clone(),
                    position: metres(&line.source.position),
                    incident_voltage: line.incident_voltage.clone(),
                    incident_current: line.incident_current.clone(),
                    total_voltage: line.total_voltage.clone(),
                    total_current: line.total_current.clone(),
                }
            })
            .collect();

        Self {
            magic: MAGIC.into(),
            version: VERSION,
            metadata: Metadata {
                title: grid.title().to_owned(),
                input_file: grid.input_file.clone(),
                model_run: run.current,
                model_runs: run.last,
                iterations: grid.iterations(),
                dt: grid.dt(),
                cells: *grid.cells(),
                spacing: *grid.spacing(),
                solve_time,
                backend: backend.into(),
                timestamp: Local::now(),
            },
            receivers,
            transmission_lines,
        }
    }

    pub fn write_json(&self, writer: impl Write) -> Result<(), Error> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn write_json_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)?;
        self.write_json(std::io::BufWriter::new(file))?;
        tracing::debug!(path = %path.display(), "wrote output");
        Ok(())
    }

    pub fn from_json_slice(json: &[u8]) -> Result<Self, Error> {
        let output: Self = serde_json::from_slice(json)?;
        if output.magic != MAGIC {
            return Err(Error::InvalidConfig(format!(
                "not a model output: magic is '{}'",
                output.magic
            )));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nalgebra::Point3;

    use super::ModelOutput;
    use crate::{
        model::{
            RunIndex,
            tests::prepared_grid,
        },
        solver::cpu::{
            CpuBackend,
            tests::{
                dipole_model,
                run_to_end,
            },
        },
    };

    #[test]
    fn receivers_are_written_in_metres() {
        let mut grid = prepared_grid(&dipole_model(10, 20));
        run_to_end(&CpuBackend::single_threaded(), &mut grid);

        let output = ModelOutput::from_grid(&grid, RunIndex::single(), Duration::from_millis(3), "cpu");
        assert_eq!(output.metadata.iterations, 20);
        assert_eq!(output.metadata.model_run, 1);
        assert_eq!(output.receivers.len(), 1);
        assert_eq!(output.receivers[0].id, "receiver_0");
        let position = output.receivers[0].position;
        assert!((position - Point3::new(8e-3, 5e-3, 5e-3)).norm() < 1e-12);
        assert_eq!(output.receivers[0].samples, grid.receivers()[0].samples);
        assert!(output.transmission_lines.is_empty());
    }

    #[test]
    fn json_keeps_samples() {
        let mut grid = prepared_grid(&dipole_model(10, 20));
        run_to_end(&CpuBackend::single_threaded(), &mut grid);
        let output = ModelOutput::from_grid(&grid, RunIndex::single(), Duration::ZERO, "cpu");

        let mut json = vec![];
        output.write_json(&mut json).unwrap();
        let read = ModelOutput::from_json_slice(&json).unwrap();
        assert_eq!(read.metadata.cells, output.metadata.cells);
        assert_eq!(read.receivers[0].samples, output.receivers[0].samples);
    }

    #[test]
    fn rejects_other_json() {
        assert!(ModelOutput::from_json_slice(b"{\"magic\": 1}").is_err());
    }
}
