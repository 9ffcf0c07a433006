pub mod adapt;
pub mod aggregate;
pub mod arm;
pub mod columns;
pub mod density;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod inference;
pub mod model;
pub mod nuts;
pub mod pipeline;
pub mod sampler;
pub mod table;
pub mod trace;
