//! Subsystems selectable at launch.

mod receive;
pub use self::receive::ReceiveCommand;

mod tools;
pub use self::tools::ToolsCommand;
