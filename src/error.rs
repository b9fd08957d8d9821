use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Epoch proposed without any rover observation: nothing to solve.
    #[error("empty epoch: no rover observation")]
    EmptyEpoch,
    /// Rover and base observations could not be paired within tolerance
    /// and interpolation was either disabled or not possible.
    #[error("rover and base epochs misaligned by more than the differential age limit")]
    EpochMisalignment,
    /// Not enough satellites sighted by both receivers survived the
    /// elevation, SNR and health masks.
    #[error("not enough common satellites ({0})")]
    NotEnoughSatellites(usize),
    /// Initialization requires at least 4 pseudo ranges with resolved
    /// satellite states.
    #[error("rover initialization failed")]
    InitializationFailure,
    /// The geometry of the remaining satellites is too weak.
    #[error("gdop {0:.1} exceeds limit")]
    GdopExceeded(f64),
    /// All double differenced measurements were rejected as outliers.
    #[error("all innovations rejected")]
    AllInnovationsRejected,
    /// Invalid orbital states or bad signal data may cause the algebric
    /// calculations to wind up here.
    #[error("failed to invert matrix")]
    MatrixInversion,
    /// Covariance lost its positive definiteness: the filter restarts
    /// with a diagonal covariance.
    #[error("covariance no longer positive definite")]
    CovarianceNotPositiveDefinite,
    /// Post fit residuals exceeded their expected magnitude: the epoch
    /// is discarded and the previous state restored.
    #[error("solution invalidated by post-fit residuals")]
    PostFitValidation,
    /// Configuration rejected at initialization.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
    /// Relative positioning requires the base position to be known,
    /// except in moving-base mode where it is re-estimated.
    #[error("unknown base position")]
    UnknownBasePosition,
}
