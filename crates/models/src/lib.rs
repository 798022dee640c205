//! Burn detector modules for the semi-supervised trainer.
//!
//! - `Detector`: the capability the orchestration layer consumes (forward, set loss,
//!   decoding, EMA blending, parameter inspection).
//! - `QueryDetector`: a small query-based set predictor used by the binaries and tests.
//!
//! The trainer never looks inside a detector; it only relies on the `Detector` trait and
//! on the module being a regular Burn `Module` so optimizers and recorders work.

pub mod detector;
pub mod ema;
pub mod loss;
pub mod postprocess;
pub mod query_detector;

pub use detector::{
    Detector, DetectorOutput, ForwardOptions, ModelInputError, ModelParameters, NamedTensor,
};
pub use loss::{greedy_match, set_prediction_loss, DetectionLosses, LossWeights};
pub use postprocess::{class_wise_nms, decode_detections, PostProcess};
pub use query_detector::{QueryDetector, QueryDetectorConfig};

pub mod prelude {
    pub use super::{
        Detector, DetectorOutput, ForwardOptions, ModelInputError, PostProcess, QueryDetector,
        QueryDetectorConfig,
    };
}
