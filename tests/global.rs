//! The process-wide heap moves the real program break, so everything touching
//! it lives in a single test.

#![cfg(unix)]

use std::thread;

use bestfit_allocator::global;

use test_log::test;

#[test]
fn process_wide_variants() {
    // Invalid requests and null releases do nothing
    let before = global::heap_stats();
    assert!(global::allocate_locked(0).is_none());
    assert!(global::allocate_unlocked(0).is_none());
    unsafe {
        global::release_locked(std::ptr::null_mut());
        global::release_unlocked(std::ptr::null_mut());
    }
    assert_eq!(global::heap_stats(), before);

    // Shared list: a released block is reused by the next fitting request
    let p = global::allocate_locked(200).unwrap();
    unsafe { p.as_ptr().write_bytes(0x5A, 200) };
    unsafe { global::release_locked(p.as_ptr()) };
    assert_eq!(global::allocate_locked(200), Some(p));
    unsafe { global::release_locked(p.as_ptr()) };
    assert!(global::shared_stats().0.is_valid());

    // Private lists: what this thread frees, another thread never sees
    let q = global::allocate_unlocked(300).unwrap();
    unsafe { global::release_unlocked(q.as_ptr()) };
    assert_eq!(global::local_stats().1.length, 1);

    let other = thread::spawn(|| {
        let r = global::allocate_unlocked(300).unwrap().as_ptr() as usize;
        (r, global::local_stats().1.length)
    })
    .join()
    .unwrap();
    assert_ne!(other.0, q.as_ptr() as usize);
    assert_eq!(other.1, 0);

    assert_eq!(global::allocate_unlocked(300), Some(q));
    assert!(global::local_stats().0.is_valid());
}
