use fail::fail_point;

use crate::error::ThlResult;

pub const STAGE_TASK_BEFORE_APPLY: &str = "stage_task.before_apply";
pub const PARALLEL_QUEUE_BEFORE_PUT: &str = "parallel_queue.before_put";

/// Returns an error when the named fail point is configured to fire.
pub fn thl_fail_point(name: &str) -> ThlResult<()> {
    fail_point!(name, |_| {
        crate::bail!(
            crate::error::ErrorKind::FailpointInjected,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
