pub mod builtin;
pub mod registry;

pub use builtin::manual_lookup::ManualLookupTool;
pub use builtin::web_search::WebSearchTool;
pub use registry::ToolRegistry;
