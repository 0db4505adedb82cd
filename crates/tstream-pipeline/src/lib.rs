// Data pipeline: applies user-ordered transform actions to records and
// fans them out to the consumers targeted by each record's routing key.

pub mod actions;
mod pipeline;
mod registry;

pub use actions::apply_actions;
pub use pipeline::{Pipeline, PipelineState};
pub use registry::{
    Consumer, ConsumerContext, ConsumerEntry, ConsumerFilter, ConsumerRegistry, LoggingConsumer,
    Tracer,
};
