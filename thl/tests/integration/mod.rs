mod interval_guard_test;
mod parallel_queue_test;
mod pipeline_test;
