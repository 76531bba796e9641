pub mod clock;
pub mod codec;
pub mod config;
pub mod counters;
pub mod cycle;
pub mod exporter;
pub mod fragment;
pub mod labels;
pub mod pool;
pub mod producer;
pub mod push;
pub mod report;
pub mod sample;
pub mod series;
pub mod transport;
pub mod util;
pub mod validate;
pub mod walltime;

pub use labels::LabelSet;
