use crate::{
    grid::Axis,
    util::format_size,
};

/// Everything that can abort a model run.
///
/// All fatal conditions are detected before the time-stepping loop starts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "Source '{source_id}' will be stepped to {position:?} on run {run}, which is outside the domain"
    )]
    SourceSteppedOutside {
        source_id: String,
        position: [i64; 3],
        run: usize,
    },

    #[error(
        "Receiver '{receiver_id}' will be stepped to {position:?} on run {run}, which is outside the domain"
    )]
    ReceiverSteppedOutside {
        receiver_id: String,
        position: [i64; 3],
        run: usize,
    },

    #[error(
        "Estimated memory required ~{} exceeds {} available on host",
        format_size(*.estimated),
        format_size(*.available)
    )]
    InsufficientHostMemory { estimated: u64, available: u64 },

    #[error(
        "Estimated memory required ~{} exceeds {} available on device {device_id} - {device_name}",
        format_size(*.estimated),
        format_size(*.available)
    )]
    InsufficientDeviceMemory {
        estimated: u64,
        available: u64,
        device_id: usize,
        device_name: String,
    },

    #[error(
        "Too many materials ({num_materials}) in the model: coefficient tables need {} but device {device_id} - {device_name} only has {} of constant memory",
        format_size(*.required),
        format_size(*.available)
    )]
    CoefficientTableTooLarge {
        num_materials: usize,
        required: u64,
        available: u64,
        device_id: usize,
        device_name: String,
    },

    #[error(
        "Non-physical wave propagation: material '{material}' has wavelength sampled by {cells_per_wavelength} cells, less than the required minimum of {minimum}. Maximum significant frequency estimated as {max_frequency:e} Hz"
    )]
    NonPhysicalPropagation {
        material: String,
        cells_per_wavelength: usize,
        minimum: usize,
        max_frequency: f64,
    },

    #[error("Unknown material '{0}'")]
    UnknownMaterial(String),

    #[error("Unknown waveform '{0}'")]
    UnknownWaveform(String),

    #[error("Invalid model description: {0}")]
    InvalidConfig(String),

    #[error("{what} at {position:?} with polarisation {polarisation} lies outside the grid")]
    OutsideGrid {
        what: String,
        position: [usize; 3],
        polarisation: Axis,
    },

    #[error("{feature} is not supported by the {backend} backend")]
    UnsupportedOnBackend {
        feature: &'static str,
        backend: &'static str,
    },

    #[error("Solver has already run {done} of {total} iterations, can't advance by {requested}")]
    IterationsExhausted {
        done: usize,
        total: usize,
        requested: usize,
    },

    #[error("Grid has not been prepared for solving")]
    NotPrepared,

    #[error("Device error: {0}")]
    Device(String),

    #[error("toml error")]
    Toml(#[from] toml::de::Error),

    #[error("json error")]
    Json(#[from] serde_json::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),
}
