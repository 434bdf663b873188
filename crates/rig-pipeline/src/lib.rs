//! The refinement pipeline for `rig-refiner`.
//!
//! Data flows through: ingest → bracketing → feature graph → tracks →
//! (per pass) triangulation → mesh intersections → problem assembly →
//! solve → copy-back → outlier flagging, and finally registration and
//! output writing.

pub mod assemble;
pub mod bracket;
pub mod config;
pub mod ingest;
pub mod mesh;
pub mod outliers;
pub mod output;
pub mod refine;
pub mod register;
pub mod report;
pub mod triangulate;
pub mod types;

pub use bracket::{
    bracket_images, calc_world_to_cam, derive_extrinsics, initial_world_to_cam, BracketOutput,
};
pub use config::{IntrinsicsToFloat, RefinerConfig};
pub use ingest::{load_streams, SensorStreams};
pub use mesh::{MeshOracle, TriangleMesh};
pub use refine::{run_passes, PassOutput, RefinerInput, RefinerState};
pub use register::apply_registration;
pub use report::RefinerReport;
pub use triangulate::InlierMask;
pub use types::CameraImage;
