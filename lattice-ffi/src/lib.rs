//! FFI bindings for the Lattice graph store
//!
//! This module provides a C-compatible interface to Lattice insertion and
//! deletion. All functions are panic-safe and use thread-local error
//! reporting.
//!
//! # Safety Guarantees
//!
//! - No panic may cross the FFI boundary (enforced by `ffi_guard`)
//! - Strict UTF-8 validation for all string inputs
//! - Null pointer checks on all pointer arguments
//! - ABI stability via `#[repr(C)]` and `extern "C"`
//!
//! # Error Handling
//!
//! Errors are reported through:
//! - Return values: NULL for open, `-1` for insert, delete and flush
//! - Thread-local error message: `lattice_last_error_message()`
//!
//! # Thread Safety
//!
//! An open index may be shared between threads: insert, delete and flush
//! all take shared access. Each thread has its own error message storage.

use lattice_core::{DistanceMetric, GraphIndex, IndexOptions, InsertOutcome, RowId, TupleLocation};
use libc::{c_char, c_float, c_int, size_t};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use std::slice;

/// `lattice_insert`: nothing was written (NULL or zero vector)
pub const LATTICE_SKIPPED: c_int = 0;

/// `lattice_insert`: a new graph node was written
pub const LATTICE_INSERTED: c_int = 1;

/// `lattice_insert`: the row was attached to an identical existing node
pub const LATTICE_COALESCED: c_int = 2;

/// Internal state holder (not exposed to C)
struct LatticeIndexState {
    inner: GraphIndex,
}

/// Opaque handle to a Lattice index (C-compatible)
///
/// C code only sees pointers to this type. The real data is stored in
/// `LatticeIndexState`.
#[repr(C)]
pub struct LatticeIndex {
    _private: [u8; 0],
}

/// Location of an element tuple: page number and slot within the page
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatticeLocation {
    /// Page number
    pub page: u32,
    /// Slot within the page
    pub slot: u16,
}

impl From<TupleLocation> for LatticeLocation {
    fn from(location: TupleLocation) -> Self {
        Self { page: location.page, slot: location.slot }
    }
}

thread_local! {
    /// Thread-local storage for error messages
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message for the current thread
///
/// Interior NULs are replaced with the escaped sequence "\\0" so reporting
/// an error can never fail.
fn set_last_error(err: impl std::fmt::Display) {
    LAST_ERROR.with(|cell| {
        let safe_msg = err.to_string().replace('\0', "\\0");
        let c_str = CString::new(safe_msg).unwrap_or_default();
        *cell.borrow_mut() = Some(c_str);
    });
}

/// Clear the last error message for the current thread
fn clear_last_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// Panic barrier that catches all panics at the FFI boundary
///
/// Returns `None` on panic after recording the panic message, allowing
/// callers to fall back to their sentinel value.
fn ffi_guard<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    // The operation is abandoned on panic, never resumed
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(e) => {
            let msg = if let Some(s) = e.downcast_ref::<&str>() {
                format!("Panic: {s}")
            } else if let Some(s) = e.downcast_ref::<String>() {
                format!("Panic: {s}")
            } else {
                "Unknown panic".to_string()
            };
            set_last_error(msg);
            None
        }
    }
}

/// Borrows the index behind an FFI handle, recording an error for NULL
///
/// # Safety
///
/// `ptr` must be NULL or a live pointer from `lattice_open*`.
unsafe fn index_ref<'a>(ptr: *const LatticeIndex) -> Option<&'a GraphIndex> {
    // SAFETY: Caller guarantees ptr is NULL or valid
    let state = unsafe { ptr.cast::<LatticeIndexState>().as_ref() };
    if state.is_none() {
        set_last_error("Null index pointer");
    }
    state.map(|s| &s.inner)
}

/// Decodes a C path argument, recording an error on failure
///
/// # Safety
///
/// `path` must be NULL or a valid NUL-terminated string.
unsafe fn path_arg<'a>(path: *const c_char) -> Option<&'a str> {
    if path.is_null() {
        set_last_error("Path cannot be NULL");
        return None;
    }

    // SAFETY: Caller guarantees path is valid C string
    let c_path = unsafe { CStr::from_ptr(path) };

    // STRICT UTF-8 CHECK: Do not use to_string_lossy()
    match c_path.to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            set_last_error("Path must be valid UTF-8");
            None
        }
    }
}

fn open_index(path: &str, dimensions: u32, options: IndexOptions) -> *mut LatticeIndex {
    match GraphIndex::open(path, dimensions, options) {
        Ok(index) => {
            clear_last_error();
            let state = Box::new(LatticeIndexState { inner: index });
            Box::into_raw(state).cast::<LatticeIndex>()
        }
        Err(e) => {
            set_last_error(format!("{e:#}"));
            ptr::null_mut()
        }
    }
}

//
// === LIFECYCLE MANAGEMENT ===
//

/// Open or create a Lattice graph file with default options
///
/// # Arguments
///
/// - `path`: UTF-8 encoded path to the graph file (must not be NULL)
/// - `dimensions`: Number of dimensions per vector (1 to 2000)
///
/// # Returns
///
/// - Non-NULL pointer on success
/// - NULL on failure (check `lattice_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// LatticeIndex* index = lattice_open("graph.lattice", 768);
/// if (index == NULL) {
///     fprintf(stderr, "Error: %s\n", lattice_last_error_message());
///     exit(1);
/// }
/// ```
///
/// # Safety
///
/// - `path` must be a valid, NUL-terminated UTF-8 string
/// - Caller must free the returned pointer with `lattice_free()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lattice_open(path: *const c_char, dimensions: u32) -> *mut LatticeIndex {
    ffi_guard(|| {
        // SAFETY: forwarded caller guarantee
        let Some(path) = (unsafe { path_arg(path) }) else {
            return ptr::null_mut();
        };
        open_index(path, dimensions, IndexOptions::default())
    })
    .unwrap_or(ptr::null_mut())
}

/// Open or create a Lattice graph file with custom options
///
/// # Arguments
///
/// - `path`: UTF-8 encoded path to the graph file (must not be NULL)
/// - `dimensions`: Number of dimensions per vector (1 to 2000)
/// - `m`: Fan-out per layer; layer 0 keeps `2 * m` (at least 2)
/// - `ef_construction`: Beam width while choosing neighbors
/// - `metric`: 0 for Euclidean, 1 for cosine, 2 for inner product
///
/// # Returns
///
/// - Non-NULL pointer on success
/// - NULL on failure (check `lattice_last_error_message()`)
///
/// # Safety
///
/// Same safety requirements as `lattice_open()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lattice_open_with_options(
    path: *const c_char,
    dimensions: u32,
    m: u32,
    ef_construction: u32,
    metric: u32,
) -> *mut LatticeIndex {
    ffi_guard(|| {
        // SAFETY: forwarded caller guarantee
        let Some(path) = (unsafe { path_arg(path) }) else {
            return ptr::null_mut();
        };

        let Ok(m) = u16::try_from(m) else {
            set_last_error(format!("m must be <= {}", u16::MAX));
            return ptr::null_mut();
        };

        let Some(metric) = u8::try_from(metric).ok().and_then(DistanceMetric::from_tag) else {
            set_last_error(format!("Unknown metric {metric}"));
            return ptr::null_mut();
        };

        let options = IndexOptions {
            m,
            ef_construction: ef_construction as usize,
            metric,
            ..IndexOptions::default()
        };
        open_index(path, dimensions, options)
    })
    .unwrap_or(ptr::null_mut())
}

/// Free a Lattice index and release all resources
///
/// # Safety
///
/// - `ptr` must be NULL or a valid pointer from `lattice_open*()`
/// - After this call, `ptr` is invalid and must not be used
/// - Safe to call with NULL (no-op)
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lattice_free(ptr: *mut LatticeIndex) {
    if !ptr.is_null() {
        ffi_guard(|| {
            // SAFETY: Caller guarantees ptr is valid (from lattice_open)
            drop(unsafe { Box::from_raw(ptr.cast::<LatticeIndexState>()) });
        });
    }
}

//
// === WRITE PATH ===
//

/// Insert a vector for an external row
///
/// # Arguments
///
/// - `ptr`: Non-NULL pointer to index
/// - `vector`: Pointer to f32 array, or NULL to skip the row
/// - `len`: Number of elements in vector (must match index dimensions)
/// - `row`: External row reference stored with the element
/// - `out_location`: Receives the element location when something was
///   written (may be NULL)
///
/// # Returns
///
/// - `LATTICE_INSERTED` if a new node was written
/// - `LATTICE_COALESCED` if the row joined an identical existing node
/// - `LATTICE_SKIPPED` if nothing was written
/// - `-1` on failure (check `lattice_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// float vec[768] = {0.1, 0.2, ...};
/// LatticeLocation at;
/// if (lattice_insert(index, vec, 768, row_id, &at) < 0) {
///     fprintf(stderr, "Insert failed: %s\n", lattice_last_error_message());
/// }
/// ```
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - `vector` must be NULL or point to `len` valid f32 values
/// - `out_location` must be NULL or valid for writes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lattice_insert(
    ptr: *const LatticeIndex,
    vector: *const c_float,
    len: size_t,
    row: u64,
    out_location: *mut LatticeLocation,
) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid
        let Some(index) = (unsafe { index_ref(ptr) }) else {
            return -1;
        };

        let vector = if vector.is_null() {
            None
        } else {
            // SAFETY: Caller guarantees vector points to len valid f32 values
            Some(unsafe { slice::from_raw_parts(vector, len) })
        };

        match index.insert(vector, RowId(row)) {
            Ok(outcome) => {
                clear_last_error();
                if let Some(location) = outcome.location() {
                    // SAFETY: Caller guarantees out_location is NULL or writable
                    if let Some(out) = unsafe { out_location.as_mut() } {
                        *out = location.into();
                    }
                }
                match outcome {
                    InsertOutcome::Inserted { .. } => LATTICE_INSERTED,
                    InsertOutcome::Coalesced { .. } => LATTICE_COALESCED,
                    InsertOutcome::Skipped(_) => LATTICE_SKIPPED,
                }
            }
            Err(e) => {
                set_last_error(format!("{e:#}"));
                -1
            }
        }
    })
    .unwrap_or(-1)
}

/// Tombstone the element at `location`
///
/// # Returns
///
/// - `1` if the element was marked deleted
/// - `0` if it was already deleted
/// - `-1` on failure (check `lattice_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lattice_mark_deleted(ptr: *const LatticeIndex, location: LatticeLocation) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid
        let Some(index) = (unsafe { index_ref(ptr) }) else {
            return -1;
        };

        match index.mark_deleted(TupleLocation::new(location.page, location.slot)) {
            Ok(deleted) => {
                clear_last_error();
                c_int::from(deleted)
            }
            Err(e) => {
                set_last_error(format!("{e:#}"));
                -1
            }
        }
    })
    .unwrap_or(-1)
}

/// Flush all committed pages to disk
///
/// # Returns
///
/// - 0 on success
/// - -1 on failure (check `lattice_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lattice_flush(ptr: *const LatticeIndex) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid
        let Some(index) = (unsafe { index_ref(ptr) }) else {
            return -1;
        };

        match index.flush() {
            Ok(()) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error(format!("{e:#}"));
                -1
            }
        }
    })
    .unwrap_or(-1)
}

//
// === INTROSPECTION ===
//

/// Get the dimensionality of vectors in the index
///
/// # Returns
///
/// - Number of dimensions, or 0 if `ptr` is NULL
///
/// # Safety
///
/// - `ptr` must be NULL or valid
#[unsafe(no_mangle)]
pub unsafe extern "C" fn lattice_dimensions(ptr: *const LatticeIndex) -> u32 {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is NULL or valid
        let state = unsafe { ptr.cast::<LatticeIndexState>().as_ref() };
        state.map_or(0, |s| u32::try_from(s.inner.dimensions()).unwrap_or(0))
    })
    .unwrap_or(0)
}

//
// === ERROR HANDLING ===
//

/// Get the last error message for the current thread
///
/// # Returns
///
/// - Pointer to NUL-terminated error string
/// - NULL if the last call on this thread succeeded
///
/// # Lifetime
///
/// The returned pointer is valid until the next FFI call on this thread.
/// **Do NOT** free the returned pointer.
#[unsafe(no_mangle)]
pub extern "C" fn lattice_last_error_message() -> *const c_char {
    LAST_ERROR.with(|cell| cell.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

/// Get the Lattice library version
///
/// The returned pointer is valid for the lifetime of the program.
/// **Do NOT** free the returned pointer.
#[unsafe(no_mangle)]
pub extern "C" fn lattice_version() -> *const c_char {
    // concat! appends the NUL terminator required by C
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

    VERSION.as_ptr().cast::<c_char>()
}

//
// === TESTS ===
//

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn c_path(dir: &TempDir, name: &str) -> CString {
        CString::new(dir.path().join(name).to_str().unwrap()).unwrap()
    }

    fn last_error() -> String {
        let error = unsafe { CStr::from_ptr(lattice_last_error_message()) };
        error.to_string_lossy().into_owned()
    }

    #[test]
    fn test_ffi_lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = c_path(&dir, "lifecycle.lattice");
        let ptr = unsafe { lattice_open(path.as_ptr(), 8) };
        assert!(!ptr.is_null(), "Failed to open index");

        let vec = [0.1f32; 8];
        let mut first = LatticeLocation { page: 0, slot: 0 };
        let status = unsafe { lattice_insert(ptr, vec.as_ptr(), 8, 1, &raw mut first) };
        assert_eq!(status, LATTICE_INSERTED);
        assert_eq!(first, LatticeLocation { page: 1, slot: 0 });

        // Identical vector joins the first node
        let mut second = LatticeLocation { page: 0, slot: 0 };
        let status = unsafe { lattice_insert(ptr, vec.as_ptr(), 8, 2, &raw mut second) };
        assert_eq!(status, LATTICE_COALESCED);
        assert_eq!(second, first);

        let other = [0.7f32; 8];
        let status = unsafe { lattice_insert(ptr, other.as_ptr(), 8, 3, ptr::null_mut()) };
        assert_eq!(status, LATTICE_INSERTED);

        assert_eq!(unsafe { lattice_mark_deleted(ptr, first) }, 1);
        assert_eq!(unsafe { lattice_mark_deleted(ptr, first) }, 0);

        assert_eq!(unsafe { lattice_flush(ptr) }, 0, "Flush should succeed");
        assert!(lattice_last_error_message().is_null());

        unsafe { lattice_free(ptr) };
    }

    #[test]
    fn test_ffi_null_vector_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = c_path(&dir, "null_vector.lattice");
        let ptr = unsafe { lattice_open(path.as_ptr(), 4) };
        assert!(!ptr.is_null());

        let mut out = LatticeLocation { page: 9, slot: 9 };
        let status = unsafe { lattice_insert(ptr, ptr::null(), 4, 1, &raw mut out) };
        assert_eq!(status, LATTICE_SKIPPED);
        assert_eq!(out, LatticeLocation { page: 9, slot: 9 }, "skipped insert must not write a location");

        unsafe { lattice_free(ptr) };
    }

    #[test]
    fn test_ffi_null_safety() {
        let ptr = unsafe { lattice_open(ptr::null(), 128) };
        assert!(ptr.is_null());
        assert!(last_error().contains("NULL"));

        let vec = [0.1f32; 4];
        let status = unsafe { lattice_insert(ptr::null(), vec.as_ptr(), 4, 1, ptr::null_mut()) };
        assert_eq!(status, -1);
        assert_eq!(last_error(), "Null index pointer");

        let location = LatticeLocation { page: 1, slot: 0 };
        assert_eq!(unsafe { lattice_mark_deleted(ptr::null(), location) }, -1);
        assert_eq!(unsafe { lattice_flush(ptr::null()) }, -1);
        assert_eq!(unsafe { lattice_dimensions(ptr::null()) }, 0);

        // Freeing NULL is a no-op
        unsafe { lattice_free(ptr::null_mut()) };
    }

    #[test]
    fn test_ffi_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = c_path(&dir, "dims.lattice");
        let ptr = unsafe { lattice_open(path.as_ptr(), 128) };
        assert!(!ptr.is_null());
        assert_eq!(unsafe { lattice_dimensions(ptr) }, 128);

        let vec = [0.1f32; 64];
        let status = unsafe { lattice_insert(ptr, vec.as_ptr(), 64, 1, ptr::null_mut()) };
        assert_eq!(status, -1, "Should fail with dimension mismatch");
        assert!(last_error().contains("dimension"), "Error should mention dimensions");

        unsafe { lattice_free(ptr) };
    }

    #[test]
    fn test_ffi_mark_deleted_bad_location() {
        let dir = TempDir::new().unwrap();
        let path = c_path(&dir, "bad_location.lattice");
        let ptr = unsafe { lattice_open(path.as_ptr(), 4) };

        let status = unsafe { lattice_mark_deleted(ptr, LatticeLocation { page: 40, slot: 0 }) };
        assert_eq!(status, -1);
        assert!(!lattice_last_error_message().is_null());

        unsafe { lattice_free(ptr) };
    }

    #[test]
    fn test_ffi_with_custom_options() {
        let dir = TempDir::new().unwrap();
        let path = c_path(&dir, "options.lattice");
        let ptr = unsafe { lattice_open_with_options(path.as_ptr(), 16, 8, 100, 1) };
        assert!(!ptr.is_null(), "Should open with custom options");

        // Cosine skips vectors with no direction
        let zero = [0.0f32; 16];
        let status = unsafe { lattice_insert(ptr, zero.as_ptr(), 16, 1, ptr::null_mut()) };
        assert_eq!(status, LATTICE_SKIPPED);

        unsafe { lattice_free(ptr) };

        let bad = c_path(&dir, "bad_metric.lattice");
        let ptr = unsafe { lattice_open_with_options(bad.as_ptr(), 16, 8, 100, 7) };
        assert!(ptr.is_null());
        assert!(last_error().contains("metric"));

        let ptr = unsafe { lattice_open_with_options(bad.as_ptr(), 16, 1, 100, 0) };
        assert!(ptr.is_null(), "m below 2 must be rejected");
    }

    #[test]
    fn test_ffi_invalid_utf8_path() {
        let invalid_bytes = b"test\xFF\xFE.lattice\0";
        let ptr = unsafe { lattice_open(invalid_bytes.as_ptr().cast::<c_char>(), 128) };
        assert!(ptr.is_null(), "Should reject invalid UTF-8");
        assert!(last_error().contains("UTF-8"), "Error should mention UTF-8");
    }

    #[test]
    fn test_ffi_version() {
        let version = unsafe { CStr::from_ptr(lattice_version()) };
        assert_eq!(version.to_string_lossy(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_ffi_error_thread_local() {
        use std::thread;

        set_last_error("Main thread error");
        assert_eq!(last_error(), "Main thread error");

        let handle = thread::spawn(|| {
            assert!(lattice_last_error_message().is_null(), "New thread should have no error");

            set_last_error("Spawned thread error");
            assert_eq!(last_error(), "Spawned thread error");
        });

        handle.join().unwrap();

        assert_eq!(last_error(), "Main thread error");
    }
}
