//! Real-time hand-tracking teleoperation: calibrate the operator frame,
//! retarget hand poses into the robot workspace, solve damped IK and stream
//! filtered joint targets to a robot backend at a fixed rate.

pub mod backend;
pub mod calibration;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod hand;
pub mod handoff;
pub mod health_monitor;
pub mod ik;
pub mod kinematics;
pub mod live_status;
pub mod recovery;
pub mod retarget;
pub mod smoothing;
pub mod source;
pub mod trajectory;
pub mod types;

pub use backend::{Backend, RobotBackend, SimulatedBackend};
pub use calibration::{CalibrationHandle, CalibrationTransform, Calibrator};
pub use config::TeleopConfig;
pub use control_loop::{ControlLoop, LoopEvent, LoopState, TickReport};
pub use error::{TeleopError, TeleopResult};
pub use ik::{IkResult, IkSolver};
pub use source::PoseSource;
pub use types::{JointLimits, JointState, Pose, PoseSample};
