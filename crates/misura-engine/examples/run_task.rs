//! Run one measurement task and print its event stream.
//!
//! Usage: `run_task [TYPE]` (defaults to NDT).

use serde_json::json;

use misura_engine::Task;

fn main() {
    let task_type = std::env::args().nth(1).unwrap_or_else(|| "NDT".to_string());
    let settings = json!({
        "type": task_type,
        "verbosity": "INFO",
    });
    eprintln!("{settings}");
    let task = Task::start(settings).expect("cannot start task");
    while let Some(event) = task.wait_for_next_event() {
        println!("{}", event.serialize());
    }
}
