pub mod agent;
pub mod cli;
pub mod events;
pub mod fanout;
pub mod input_stream;
pub mod registry;
pub mod router;
pub mod run;
pub mod store;
pub mod transcripts;
