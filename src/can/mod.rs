mod candump;
mod control_function;
mod driver;
mod frame;
mod name;

pub use candump::{CandumpFormat, CandumpParser};
pub use control_function::{
    CfHandle, ControlFunction, ControlFunctionKind, ControlFunctionRegistry, GLOBAL_ADDRESS,
    NULL_ADDRESS,
};
pub use driver::{CandumpReplayDriver, CanDriver, DriverRegistry, MockDriver};
pub use frame::{canid, CanFrame, CanMessage};
pub use name::{IndustryGroup, Name, NameBuilder, SelfConfigurable};
