pub mod manager;
pub mod stackset;

pub use manager::CONTROLLER_MANAGER;
pub use manager::Controller;
pub use manager::ControllerManager;
pub use stackset::StackSetController;
