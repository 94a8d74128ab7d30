pub mod api;
pub mod batch;
pub mod character;
pub mod credit;
pub mod curation;
pub mod job;
