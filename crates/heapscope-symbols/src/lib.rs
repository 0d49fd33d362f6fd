//! Batched symbol resolution for heapscope
//!
//! [`SymbolPipeline`] caches resolved frame addresses for a session and
//! feeds unseen ones to a [`FrameResolver`] in batches. [`ToolResolver`]
//! resolves through the external heap tool; [`ModuleOffsetResolver`] names
//! frames by module and offset when no tool or debug information is around.

pub mod pipeline;
pub mod resolver;
pub mod tool_resolver;

pub use pipeline::{Lookup, PipelineConfig, SymbolFuture, SymbolPipeline};
pub use resolver::{FrameResolver, ModuleOffsetResolver, ModuleTable};
pub use tool_resolver::ToolResolver;
