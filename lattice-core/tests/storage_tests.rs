use lattice_core::header::Header;
use lattice_core::page::{FIRST_DATA_PAGE, INVALID_PAGE, PAGE_SIZE};
use lattice_core::storage::PageStore;
use std::io::Write;
use tempfile::NamedTempFile;

fn template(dims: u32) -> Header {
    Header::new(dims, 16, 0, PAGE_SIZE as u32, FIRST_DATA_PAGE)
}

#[test]
fn test_create_and_open() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();

    // Create new store
    let store = PageStore::open(path, &template(128)).unwrap();
    assert_eq!(store.page_count(), 2);
    assert_eq!(store.header().unwrap().dimensions, 128);
    drop(store);

    // Reopen existing store
    let store = PageStore::open(path, &template(128)).unwrap();
    assert_eq!(store.page_count(), 2);
    assert_eq!(store.header().unwrap().insert_page, FIRST_DATA_PAGE);
}

#[test]
fn test_dimension_mismatch() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();

    drop(PageStore::open(path, &template(128)).unwrap());

    let result = PageStore::open(path, &template(256));
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("Dimension mismatch"));
}

#[test]
fn test_fan_out_mismatch() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();

    drop(PageStore::open(path, &template(128)).unwrap());

    let other = Header::new(128, 8, 0, PAGE_SIZE as u32, FIRST_DATA_PAGE);
    let result = PageStore::open(path, &other);
    assert!(result.unwrap_err().to_string().contains("parameter mismatch"));
}

#[test]
fn test_exclusive_locking() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();

    // First instance owns the lock
    let _store1 = PageStore::open(path, &template(128)).unwrap();

    // Second instance should fail to open the same file
    let store2 = PageStore::open(path, &template(128));
    assert!(store2.is_err());
    assert!(store2.unwrap_err().to_string().contains("already open"));
}

#[test]
fn test_lock_released_on_drop() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();

    {
        let _store = PageStore::open(path, &template(128)).unwrap();
    }

    let store2 = PageStore::open(path, &template(128));
    assert!(store2.is_ok(), "Lock should be released after drop");
}

#[test]
fn test_file_growth_is_page_aligned() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();
    let store = PageStore::open(path, &template(128)).unwrap();

    let mut group = store.begin_group();
    group.append_page().unwrap();
    group.append_page().unwrap();
    group.commit().unwrap();
    store.flush().unwrap();

    let meta = std::fs::metadata(path).unwrap();
    assert_eq!(meta.len(), 4 * PAGE_SIZE as u64);
    assert_eq!(meta.len() % PAGE_SIZE as u64, 0, "File size must be page-aligned");
}

#[test]
fn test_out_of_bounds_read() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = PageStore::open(temp_file.path(), &template(128)).unwrap();

    let result = store.read_page(2);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("out of bounds"));
}

#[test]
fn test_persistence_across_reopens() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();
    let tuple = [42u8; 40];

    // Write a tuple on the root page and link a new page behind it
    {
        let store = PageStore::open(path, &template(128)).unwrap();
        let mut group = store.begin_group();
        let root = group.register(store.lock_exclusive(FIRST_DATA_PAGE).unwrap()).unwrap();
        let tail = group.append_page().unwrap();
        let tail_id = group.page_id(tail);

        group.page_mut(root).add_item(&tuple).unwrap();
        group.page_mut(root).set_next_page(tail_id);
        group.commit().unwrap();
        store.flush().unwrap();
    }

    // Reopen and verify
    {
        let store = PageStore::open(path, &template(128)).unwrap();
        assert_eq!(store.page_count(), 3);

        let root = store.read_page(FIRST_DATA_PAGE).unwrap();
        assert_eq!(root.item(0).unwrap(), &tuple);
        assert_eq!(root.next_page(), 2);
        assert_eq!(store.read_page(2).unwrap().next_page(), INVALID_PAGE);
    }
}

#[test]
fn test_uncommitted_group_is_not_persisted() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path();

    {
        let store = PageStore::open(path, &template(128)).unwrap();
        let mut group = store.begin_group();
        let root = group.register(store.lock_exclusive(FIRST_DATA_PAGE).unwrap()).unwrap();
        group.page_mut(root).add_item(&[1u8; 16]).unwrap();
        group.append_page().unwrap();
        // Dropped without commit
    }

    let store = PageStore::open(path, &template(128)).unwrap();
    assert_eq!(store.page_count(), 2);
    assert_eq!(store.read_page(FIRST_DATA_PAGE).unwrap().slot_count(), 0);
}

#[test]
fn test_corrupted_file_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(&vec![0xAB; 2 * PAGE_SIZE]).unwrap();
    temp_file.flush().unwrap();

    let result = PageStore::open(temp_file.path(), &template(128));
    assert!(result.is_err());
}

#[test]
fn test_truncated_file_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(&[0u8; 100]).unwrap();
    temp_file.flush().unwrap();

    let result = PageStore::open(temp_file.path(), &template(128));
    assert!(result.unwrap_err().to_string().contains("not a valid Lattice index"));
}

#[test]
fn test_registered_page_stays_locked() {
    let temp_file = NamedTempFile::new().unwrap();
    let store = PageStore::open(temp_file.path(), &template(128)).unwrap();

    let mut group = store.begin_group();
    group.register(store.lock_exclusive(FIRST_DATA_PAGE).unwrap()).unwrap();

    assert!(store.try_lock_exclusive(FIRST_DATA_PAGE).unwrap().is_none());

    group.abort();
    assert!(store.try_lock_exclusive(FIRST_DATA_PAGE).unwrap().is_some());
}
