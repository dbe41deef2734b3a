//! C ABI exports for the misura engine.
//!
//! All functions are `#[no_mangle] extern "C"`, use only FFI-safe types,
//! and tolerate null arguments. Strings returned by event accessors stay
//! valid until `misura_event_destroy` releases the event: the event
//! handle owns every `CString` it has handed out.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_double, c_int, c_ulong, CStr, CString};

use misura_engine::{Event, Task};

const VERSION_MAJOR: c_ulong = 0;
const VERSION_MINOR: c_ulong = 1;

/// An opaque task handle.
pub struct misura_task_t {
    task: Task,
}

/// An opaque event handle. Owns the strings its accessors return.
pub struct misura_event_t {
    event: Event,
    strings: Vec<CString>,
}

impl misura_event_t {
    /// Keep `text` alive for the lifetime of the handle and return a
    /// pointer to it. Interior NULs cannot cross the C boundary.
    fn keep(&mut self, text: String) -> *const c_char {
        match CString::new(text) {
            Ok(cstring) => {
                self.strings.push(cstring);
                self.strings[self.strings.len() - 1].as_ptr()
            }
            Err(_) => std::ptr::null(),
        }
    }
}

#[no_mangle]
pub extern "C" fn misura_version_major() -> c_ulong {
    VERSION_MAJOR
}

#[no_mangle]
pub extern "C" fn misura_version_minor() -> c_ulong {
    VERSION_MINOR
}

// ── Task ────────────────────────────────────────────────────────────

/// Parse `settings` as JSON and start a task. Returns null when
/// `settings` is null, not UTF-8, or not parseable JSON; any other
/// settings problem surfaces as FAILURE/END events on the stream.
#[no_mangle]
pub extern "C" fn misura_task_create(settings: *const c_char) -> *mut misura_task_t {
    if settings.is_null() {
        return std::ptr::null_mut();
    }
    let text = match unsafe { CStr::from_ptr(settings) }.to_str() {
        Ok(text) => text,
        Err(_) => return std::ptr::null_mut(),
    };
    let doc: serde_json::Value = match serde_json::from_str(text) {
        Ok(doc) => doc,
        Err(_) => return std::ptr::null_mut(),
    };
    match Task::start(doc) {
        Ok(task) => Box::into_raw(Box::new(misura_task_t { task })),
        Err(_) => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn misura_task_is_running(task: *mut misura_task_t) -> c_int {
    if task.is_null() {
        return 0;
    }
    let task = unsafe { &*task };
    c_int::from(task.task.is_running())
}

#[no_mangle]
pub extern "C" fn misura_task_interrupt(task: *mut misura_task_t) {
    if task.is_null() {
        return;
    }
    let task = unsafe { &*task };
    task.task.interrupt();
}

/// Block until the next event. Returns null at end-of-stream (and for a
/// null task).
#[no_mangle]
pub extern "C" fn misura_task_wait_for_next_event(task: *mut misura_task_t) -> *mut misura_event_t {
    if task.is_null() {
        return std::ptr::null_mut();
    }
    let task = unsafe { &*task };
    match task.task.wait_for_next_event() {
        Some(event) => Box::into_raw(Box::new(misura_event_t {
            event,
            strings: Vec::new(),
        })),
        None => std::ptr::null_mut(),
    }
}

/// Destroy the task. Joins the background thread: interrupt the task or
/// drain its stream first if it may still be running.
#[no_mangle]
pub extern "C" fn misura_task_destroy(task: *mut misura_task_t) {
    if task.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(task) });
}

// ── Event ───────────────────────────────────────────────────────────

fn with_key<R>(
    event: *mut misura_event_t,
    key: *const c_char,
    fallback: R,
    body: impl FnOnce(&mut misura_event_t, &str) -> R,
) -> R {
    if event.is_null() || key.is_null() {
        return fallback;
    }
    let event = unsafe { &mut *event };
    match unsafe { CStr::from_ptr(key) }.to_str() {
        Ok(key) => body(event, key),
        Err(_) => fallback,
    }
}

#[no_mangle]
pub extern "C" fn misura_event_get_type(event: *mut misura_event_t) -> *const c_char {
    if event.is_null() {
        return std::ptr::null();
    }
    let event = unsafe { &mut *event };
    let name = event.event.event_type().as_str().to_string();
    event.keep(name)
}

#[no_mangle]
pub extern "C" fn misura_event_serialize(event: *mut misura_event_t) -> *const c_char {
    if event.is_null() {
        return std::ptr::null();
    }
    let event = unsafe { &mut *event };
    let serialized = event.event.serialize();
    event.keep(serialized)
}

#[no_mangle]
pub extern "C" fn misura_event_has_null_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> c_int {
    with_key(event, key, 0, |event, key| {
        c_int::from(event.event.has_null_entry(key))
    })
}

#[no_mangle]
pub extern "C" fn misura_event_has_string_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> c_int {
    with_key(event, key, 0, |event, key| {
        c_int::from(event.event.has_string_entry(key))
    })
}

#[no_mangle]
pub extern "C" fn misura_event_has_int_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> c_int {
    with_key(event, key, 0, |event, key| {
        c_int::from(event.event.has_int_entry(key))
    })
}

#[no_mangle]
pub extern "C" fn misura_event_has_double_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> c_int {
    with_key(event, key, 0, |event, key| {
        c_int::from(event.event.has_double_entry(key))
    })
}

#[no_mangle]
pub extern "C" fn misura_event_has_list_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> c_int {
    with_key(event, key, 0, |event, key| {
        c_int::from(event.event.has_list_entry(key))
    })
}

#[no_mangle]
pub extern "C" fn misura_event_has_object_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> c_int {
    with_key(event, key, 0, |event, key| {
        c_int::from(event.event.has_object_entry(key))
    })
}

#[no_mangle]
pub extern "C" fn misura_event_get_string_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> *const c_char {
    with_key(event, key, std::ptr::null(), |event, key| {
        match event.event.get_string_entry(key) {
            Some(value) => {
                let owned = value.to_string();
                event.keep(owned)
            }
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub extern "C" fn misura_event_get_int_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> c_int {
    with_key(event, key, 0, |event, key| {
        event.event.get_int_entry(key).unwrap_or(0) as c_int
    })
}

#[no_mangle]
pub extern "C" fn misura_event_get_double_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> c_double {
    with_key(event, key, 0.0, |event, key| {
        event.event.get_double_entry(key).unwrap_or(0.0)
    })
}

#[no_mangle]
pub extern "C" fn misura_event_get_serialized_list_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> *const c_char {
    with_key(event, key, std::ptr::null(), |event, key| {
        match event.event.get_serialized_list_entry(key) {
            Some(serialized) => event.keep(serialized),
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub extern "C" fn misura_event_get_serialized_object_entry(
    event: *mut misura_event_t,
    key: *const c_char,
) -> *const c_char {
    with_key(event, key, std::ptr::null(), |event, key| {
        match event.event.get_serialized_object_entry(key) {
            Some(serialized) => event.keep(serialized),
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub extern "C" fn misura_event_destroy(event: *mut misura_event_t) {
    if event.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(event) });
}
