//! Exercises the C surface the way a foreign consumer would: create a
//! task from serialized settings, drain the stream through event
//! handles, inspect fields through the typed accessors.

use std::ffi::{CStr, CString};

use misura_ffi::*;

fn cstr(text: &str) -> CString {
    CString::new(text).unwrap()
}

unsafe fn as_string(ptr: *const std::ffi::c_char) -> String {
    assert!(!ptr.is_null());
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

#[test]
fn version_is_exposed() {
    assert_eq!(misura_version_major(), 0);
    assert_eq!(misura_version_minor(), 1);
}

#[test]
fn null_arguments_are_tolerated() {
    assert!(misura_task_create(std::ptr::null()).is_null());
    assert_eq!(misura_task_is_running(std::ptr::null_mut()), 0);
    misura_task_interrupt(std::ptr::null_mut());
    assert!(misura_task_wait_for_next_event(std::ptr::null_mut()).is_null());
    misura_task_destroy(std::ptr::null_mut());
    assert!(misura_event_get_type(std::ptr::null_mut()).is_null());
    assert!(misura_event_serialize(std::ptr::null_mut()).is_null());
    misura_event_destroy(std::ptr::null_mut());
}

#[test]
fn malformed_json_yields_no_task() {
    let settings = cstr("{not json");
    assert!(misura_task_create(settings.as_ptr()).is_null());
}

#[test]
fn full_stream_through_the_c_surface() {
    let settings = cstr(r#"{"type": "NDT", "verbosity": "INFO"}"#);
    let task = misura_task_create(settings.as_ptr());
    assert!(!task.is_null());

    let mut types = Vec::new();
    let mut saw_failure = false;
    loop {
        let event = misura_task_wait_for_next_event(task);
        if event.is_null() {
            break; // end-of-stream
        }
        let ty = unsafe { as_string(misura_event_get_type(event)) };
        if ty == "FAILURE" {
            saw_failure = true;
        }
        if ty == "LOG" {
            assert_eq!(misura_event_has_string_entry(event, cstr("message").as_ptr()), 1);
            let serialized = unsafe { as_string(misura_event_serialize(event)) };
            assert!(serialized.contains("\"type\":\"LOG\""));
        }
        types.push(ty);
        misura_event_destroy(event);
    }

    assert!(!saw_failure);
    assert_eq!(types.last().map(String::as_str), Some("END"));
    assert_eq!(misura_task_is_running(task), 0);
    misura_task_destroy(task);
}

#[test]
fn bad_settings_surface_as_failure_events() {
    // Valid JSON, but not an object: the task exists and its stream
    // reports the problem.
    let settings = cstr("42");
    let task = misura_task_create(settings.as_ptr());
    assert!(!task.is_null());

    let mut reasons = Vec::new();
    loop {
        let event = misura_task_wait_for_next_event(task);
        if event.is_null() {
            break;
        }
        let ty = unsafe { as_string(misura_event_get_type(event)) };
        if ty == "FAILURE" {
            let reason = misura_event_get_string_entry(event, cstr("failure").as_ptr());
            reasons.push(unsafe { as_string(reason) });
        }
        misura_event_destroy(event);
    }
    misura_task_destroy(task);

    assert_eq!(reasons, ["value_error"]);
}

#[test]
fn accessor_pointers_stay_valid_until_destroy() {
    let settings = cstr(r#"{"type": "NDT", "verbosity": "INFO"}"#);
    let task = misura_task_create(settings.as_ptr());
    assert!(!task.is_null());

    // Find a RESULT event; its entry is an object.
    let mut checked = false;
    loop {
        let event = misura_task_wait_for_next_event(task);
        if event.is_null() {
            break;
        }
        let ty = unsafe { as_string(misura_event_get_type(event)) };
        if ty == "RESULT" {
            let key = cstr("entry");
            assert_eq!(misura_event_has_object_entry(event, key.as_ptr()), 1);
            let first = misura_event_get_serialized_object_entry(event, key.as_ptr());
            let second = misura_event_get_type(event);
            // Both pointers must still read correctly: earlier strings
            // are not invalidated by later accessor calls.
            let entry = unsafe { as_string(first) };
            assert!(entry.contains("test_name"));
            assert_eq!(unsafe { as_string(second) }, "RESULT");
            checked = true;
        }
        misura_event_destroy(event);
    }
    misura_task_destroy(task);
    assert!(checked, "no RESULT event in the stream");
}

#[test]
fn interrupt_through_the_c_surface() {
    let settings = cstr(r#"{"type": "NDT"}"#);
    let task = misura_task_create(settings.as_ptr());
    assert!(!task.is_null());
    misura_task_interrupt(task);

    let mut ends = 0;
    loop {
        let event = misura_task_wait_for_next_event(task);
        if event.is_null() {
            break;
        }
        if unsafe { as_string(misura_event_get_type(event)) } == "END" {
            ends += 1;
        }
        misura_event_destroy(event);
    }
    assert!(ends <= 1);
    misura_task_destroy(task);
}
