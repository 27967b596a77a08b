// ABOUTME: Library half of the stratus binary
// ABOUTME: Logging setup and control-plane assembly shared by the CLI and its tests

pub mod control_plane;
pub mod logging;

pub use control_plane::{
    grant_group, issue_token, open_storage, ControlPlane, ControlPlaneConfig, IssuedToken,
};
pub use logging::init_logging;
