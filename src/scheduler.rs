pub mod allocator;
pub mod calendar;
pub mod distribution;
pub mod engine;
pub mod feasible;
pub mod host_expression;
pub mod range;
pub mod standing;
pub mod timeline;
