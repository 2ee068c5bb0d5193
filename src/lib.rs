pub mod accumulator;
pub mod checkpoint;
pub mod config;
pub mod estimate;
pub mod extract;
pub mod fetch;
pub mod filter;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod publish;
pub mod shard;
pub mod snapshot;
pub mod topology;
pub mod types;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
