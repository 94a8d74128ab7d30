pub mod batch;
pub mod credits;
pub mod cron;
pub mod curation;
pub mod image_source;
pub mod jobs;
pub mod providers;
pub mod queue;
pub mod scheduler;
pub mod stages;
pub mod storage;
pub mod taxonomy;
pub mod workers_ai;
