//! The input-source multiplexer (§4.5): four independent components, each
//! driving the same `RegisteredInputs::notify_input_handler` entry point.
//! No shared base type — composition, not inheritance.

pub mod from_files;
pub mod from_http;
pub mod from_outputs;
pub mod from_set;

pub use from_files::FromFiles;
pub use from_http::{FromHttp, HttpSource};
pub use from_outputs::FromOutputs;
pub use from_set::FromSetCommands;
