//! examguard-core: face verification engine for exam proctoring.
//!
//! SeetaFace (rustface) finds faces, an LBPH classifier decides who they
//! are, and an optional ArcFace model (ONNX Runtime) backs identification.
//! [`Proctor`] ties enrollment, training, verification and identification
//! together over a file-backed sample store.

pub mod annotate;
pub mod config;
pub mod decision;
pub mod detector;
pub mod embedding;
pub mod labels;
pub mod lbph;
pub mod media;
pub mod proctor;
pub mod recognizer;
pub mod store;
pub mod types;

pub use config::ProctorConfig;
pub use decision::{FaceTag, SessionStatus};
pub use proctor::{
    EngineStatus, EnrollOutcome, FaceReport, IdentifyMethod, IdentifyReport, Proctor,
    ProctorError, VerifyError, VerifyReport,
};
pub use types::{BoundingBox, Embedding};
