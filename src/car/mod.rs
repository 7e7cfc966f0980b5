//! CAR (Content Addressable aRchive) import and export
//!
//! Full-repo sync and firehose commit payloads both travel as CAR v1
//! streams: a header declaring the root CID (always the head commit), then
//! CID-tagged block frames.

pub mod reader;
pub mod writer;

pub use reader::{parse_car_bytes, read_car, read_car_header, ParsedCar};
pub use writer::{export_repo_car, write_car, write_car_bytes};
