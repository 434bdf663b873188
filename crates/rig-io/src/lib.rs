//! File formats exchanged by `rig-refiner`.
//!
//! Everything here is batch-oriented and fatal-at-detection: a malformed
//! input aborts the run with a message, there are no partial reads.

pub mod control_points;
pub mod depth_cloud;
pub mod error;
pub mod image_list;
pub mod match_file;
pub mod nvm;
pub mod rig_config;

pub use control_points::{read_control_points, read_xyz_measurements, ControlPoint};
pub use depth_cloud::{read_depth_cloud, write_depth_cloud, DepthCloud};
pub use error::IoError;
pub use image_list::{read_image_list, write_image_list, ImageListEntry, NO_DEPTH_FILE};
pub use match_file::{match_file_name, read_match_file, write_match_file, IpRecord};
pub use nvm::{read_nvm, write_nvm, NvmData};
pub use rig_config::{read_rig_config, write_rig_config};
