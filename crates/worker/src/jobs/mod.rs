pub mod automation_retry;
