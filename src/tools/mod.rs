pub mod executor;
pub mod filesystem;
pub mod limits;
pub mod manifest;
pub mod network;
pub mod plugin;
pub mod registry;
pub mod schema;
pub mod system;

pub use executor::ToolExecutor;
pub use manifest::{ParamRole, ParamType, RiskClass, ToolManifest, ToolParameter};
pub use plugin::PluginTool;
pub use registry::{Tool, ToolContext, ToolError, ToolRegistry, ToolStats};
pub use schema::{normalize_arguments, plan_schema_json};

use crate::config::AppConfig;
use crate::core::EngineError;

/// 注册全部内置工具
pub fn register_builtins(registry: &mut ToolRegistry, config: &AppConfig) -> Result<(), EngineError> {
    registry.register(filesystem::SearchTool::new())?;
    registry.register(filesystem::ReadTool::new())?;
    registry.register(filesystem::ListTool::new())?;
    registry.register(filesystem::InfoTool::new())?;
    registry.register(filesystem::WriteTool::new())?;
    registry.register(filesystem::CopyTool::new())?;
    registry.register(filesystem::MoveTool::new())?;
    registry.register(filesystem::DeleteTool::new())?;
    registry.register(filesystem::CreateDirectoryTool::new())?;
    registry.register(system::CommandTool::new(
        config.tools.shell.allowed_commands.clone(),
    ))?;
    registry.register(network::FetchTool::new(
        config.tools.fetch.timeout_secs,
        config.tools.fetch.max_result_chars,
    ))?;
    Ok(())
}
