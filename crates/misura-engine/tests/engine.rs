//! End-to-end task scenarios: lifecycle, failure paths, interruption and
//! admission serialization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use misura_engine::{Event, EventType, Semaphore, Task};

fn drain(task: &Task) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = task.wait_for_next_event() {
        events.push(event);
    }
    events
}

fn count(events: &[Event], ty: EventType) -> usize {
    events.iter().filter(|ev| ev.event_type() == ty).count()
}

#[test]
fn happy_path_streams_logs_then_end() {
    let settings = json!({"type": "NDT", "verbosity": "INFO"});
    let task = Task::start_with_semaphore(settings, Arc::new(Semaphore::new())).unwrap();
    let events = drain(&task);

    assert!(!task.is_running());
    assert_eq!(count(&events, EventType::Failure), 0);
    assert_eq!(count(&events, EventType::End), 1);
    assert_eq!(events.last().unwrap().event_type(), EventType::End);

    // The runnable announced itself on the log channel.
    let starting = events.iter().any(|ev| {
        ev.event_type() == EventType::Log
            && ev
                .get_string_entry("message")
                .is_some_and(|msg| msg.contains("starting"))
    });
    assert!(starting, "expected a LOG line about the start");

    // One report entry for the single (input-less) measurement.
    assert_eq!(count(&events, EventType::Result), 1);
}

#[test]
fn events_arrive_in_emission_order() {
    let settings = json!({"type": "NDT", "verbosity": "DEBUG2"});
    let task = Task::start_with_semaphore(settings, Arc::new(Semaphore::new())).unwrap();
    let events = drain(&task);

    let positions: Vec<usize> = [
        EventType::Queued,
        EventType::Started,
        EventType::Configured,
        EventType::End,
    ]
    .iter()
    .map(|ty| {
        events
            .iter()
            .position(|ev| ev.event_type() == *ty)
            .unwrap_or_else(|| panic!("missing {ty}"))
    })
    .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted, "lifecycle events out of order");
}

#[test]
fn unknown_type_fails_with_value_error() {
    let settings = json!({"type": "nonesuch"});
    let task = Task::start_with_semaphore(settings, Arc::new(Semaphore::new())).unwrap();
    let events = drain(&task);

    let failures: Vec<&Event> = events
        .iter()
        .filter(|ev| ev.event_type() == EventType::Failure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].get_string_entry("failure"), Some("value_error"));
    assert_eq!(count(&events, EventType::End), 1);
    assert_eq!(events.last().unwrap().event_type(), EventType::End);

    // The diagnostic names the offending type.
    let diagnostic = events.iter().any(|ev| {
        ev.event_type() == EventType::Log
            && ev
                .get_string_entry("message")
                .is_some_and(|msg| msg.contains("nonesuch"))
    });
    assert!(diagnostic);
}

#[test]
fn immediate_interrupt_terminates_the_stream() {
    let settings = json!({"type": "NDT"});
    let task = Task::start_with_semaphore(settings, Arc::new(Semaphore::new())).unwrap();
    task.interrupt();
    let events = drain(&task);

    assert!(count(&events, EventType::Failure) <= 1);
    assert!(count(&events, EventType::End) <= 1);
    // Sticky end-of-stream afterwards.
    assert!(task.wait_for_next_event().is_none());
}

#[test]
fn interrupt_while_queued_terminates_without_running() {
    let semaphore = Arc::new(Semaphore::new());
    semaphore.acquire(); // park the task in QUEUED
    let task =
        Task::start_with_semaphore(json!({"type": "NDT", "verbosity": "INFO"}), Arc::clone(&semaphore))
            .unwrap();
    task.interrupt();
    semaphore.release();
    let events = drain(&task);

    // The runnable never ran: no report entry, no start log.
    assert_eq!(count(&events, EventType::Result), 0);
    assert!(count(&events, EventType::Failure) <= 1);
    assert!(!task.is_running());
}

#[test]
fn interrupt_is_idempotent() {
    let task =
        Task::start_with_semaphore(json!({"type": "NDT"}), Arc::new(Semaphore::new())).unwrap();
    task.interrupt();
    task.interrupt();
    task.interrupt();
    let events = drain(&task);
    assert!(count(&events, EventType::End) <= 1);
}

#[test]
fn admission_gate_serializes_tasks() {
    let semaphore = Arc::new(Semaphore::new());
    let slow = json!({
        "type": "TCP_CONNECT",
        "verbosity": "INFO",
        // Enough inputs that the first task measurably overlaps the
        // second task's creation.
        "inputs": (0..200).map(|i| format!("host-{i}")).collect::<Vec<_>>(),
    });
    let first = Task::start_with_semaphore(slow, Arc::clone(&semaphore)).unwrap();
    let second =
        Task::start_with_semaphore(json!({"type": "NDT", "verbosity": "INFO"}), semaphore)
            .unwrap();

    // Drain the second task first: its events can only materialize after
    // the first task released the gate, so by the time we see its END,
    // the first task's whole stream must already be queued.
    let second_events = drain(&second);
    assert_eq!(second_events.last().unwrap().event_type(), EventType::End);
    assert!(!first.is_running(), "tasks overlapped the admission gate");

    let first_events = drain(&first);
    assert_eq!(count(&first_events, EventType::Result), 200);
    assert_eq!(first_events.last().unwrap().event_type(), EventType::End);
}

#[test]
fn disabled_events_are_dropped() {
    let settings = json!({
        "type": "NDT",
        "verbosity": "INFO",
        "disabled_events": ["LOG", "PROGRESS", "RESULT"],
    });
    let task = Task::start_with_semaphore(settings, Arc::new(Semaphore::new())).unwrap();
    let events = drain(&task);

    assert_eq!(count(&events, EventType::Log), 0);
    assert_eq!(count(&events, EventType::Progress), 0);
    assert_eq!(count(&events, EventType::Result), 0);
    assert_eq!(count(&events, EventType::End), 1);
}

#[test]
fn progress_reaches_the_consumer() {
    let settings = json!({
        "type": "TCP_CONNECT",
        "inputs": ["a", "b", "c"],
    });
    let task = Task::start_with_semaphore(settings, Arc::new(Semaphore::new())).unwrap();
    let events = drain(&task);

    let percentages: Vec<f64> = events
        .iter()
        .filter(|ev| ev.event_type() == EventType::Progress)
        .filter_map(|ev| ev.get_double_entry("percentage"))
        .collect();
    assert!(!percentages.is_empty());
    // Monotone, ending at 100%.
    for pair in percentages.windows(2) {
        assert!(pair[0] <= pair[1]);
    }
    assert_eq!(*percentages.last().unwrap(), 1.0);
}

#[test]
fn input_requiring_task_without_inputs_fails() {
    let settings = json!({"type": "TCP_CONNECT", "verbosity": "INFO"});
    let task = Task::start_with_semaphore(settings, Arc::new(Semaphore::new())).unwrap();
    let events = drain(&task);

    let failures: Vec<&Event> = events
        .iter()
        .filter(|ev| ev.event_type() == EventType::Failure)
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].get_string_entry("failure"), Some("value_error"));
    assert_eq!(events.last().unwrap().event_type(), EventType::End);
}

#[test]
fn output_file_collects_report_entries() {
    let dir = std::env::temp_dir().join(format!("misura-engine-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("report.jsonl");

    let settings = json!({
        "type": "NDT",
        "output_file": path.to_string_lossy(),
        "annotations": {"campaign": "integration"},
    });
    let task = Task::start_with_semaphore(settings, Arc::new(Semaphore::new())).unwrap();
    let events = drain(&task);
    assert_eq!(count(&events, EventType::Failure), 0);

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1);
    let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(entry["test_name"], "NDT");
    assert_eq!(entry["annotations"]["campaign"], "integration");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn wait_for_next_event_blocks_until_events_arrive() {
    let semaphore = Arc::new(Semaphore::new());
    semaphore.acquire();
    let task =
        Task::start_with_semaphore(json!({"type": "NDT"}), Arc::clone(&semaphore)).unwrap();

    // Only QUEUED can be in the pipe while the gate is held; after that
    // the consumer must park rather than see a phantom end-of-stream.
    let queued = task.wait_for_next_event().unwrap();
    assert_eq!(queued.event_type(), EventType::Queued);

    let release_semaphore = Arc::clone(&semaphore);
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        release_semaphore.release();
    });

    let start = Instant::now();
    let next = task.wait_for_next_event();
    assert!(next.is_some(), "stream ended while the task was queued");
    assert!(start.elapsed() >= Duration::from_millis(100));
    releaser.join().unwrap();
    let _ = drain(&task);
}
