//! Lifecycle of the user-defined operation registry.
//!
//! The registry is process-wide, so tests that allocate many slots
//! serialize behind a lock to keep their capacity arithmetic honest.

use std::sync::Mutex;

use collectives::datatype::{DynBuffer, DynBufferMut};
use collectives::error::Error;
use collectives::operation::{
    reduce_local_into, reduce_local_opaque_into, SystemOperation, UserOperation,
    MAX_USER_OPERATIONS,
};

static REGISTRY_TESTS: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    REGISTRY_TESTS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn identity(_input: DynBuffer<'_>, _inout: DynBufferMut<'_>) -> collectives::Result<()> {
    Ok(())
}

#[test]
fn registry_capacity_is_bounded_and_slots_are_reusable() {
    let _guard = lock();
    let first: Vec<UserOperation> = (0..MAX_USER_OPERATIONS)
        .map(|_| UserOperation::commutative(identity).unwrap())
        .collect();
    assert!(matches!(
        UserOperation::commutative(identity),
        Err(Error::ResourceExhausted(n)) if n == MAX_USER_OPERATIONS
    ));
    for op in first {
        op.free().unwrap();
    }
    // freed slots are immediately available again
    let second: Vec<UserOperation> = (0..MAX_USER_OPERATIONS)
        .map(|_| UserOperation::commutative(identity).unwrap())
        .collect();
    for op in second {
        op.free().unwrap();
    }
}

#[test]
fn create_free_cycles_do_not_leak_slots() {
    let _guard = lock();
    for _ in 0..10 * MAX_USER_OPERATIONS {
        let op = UserOperation::commutative(identity).unwrap();
        op.free().unwrap();
    }
}

#[test]
fn slots_are_isolated_from_each_other() {
    let _guard = lock();
    let add = UserOperation::commutative(|input, mut inout| {
        let a: Vec<i32> = input.decode()?;
        let b: Vec<i32> = inout.decode()?;
        let sum: Vec<i32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        inout.encode(&sum)
    })
    .unwrap();
    let mul = UserOperation::commutative(|input, mut inout| {
        let a: Vec<i32> = input.decode()?;
        let b: Vec<i32> = inout.decode()?;
        let product: Vec<i32> = a.iter().zip(&b).map(|(x, y)| x * y).collect();
        inout.encode(&product)
    })
    .unwrap();

    let mut out = 4i32;
    reduce_local_into(&3i32, &mut out, &add).unwrap();
    assert_eq!(out, 7);
    reduce_local_into(&3i32, &mut out, &mul).unwrap();
    assert_eq!(out, 21);

    // freeing one slot leaves the other fully operational
    add.free().unwrap();
    reduce_local_into(&2i32, &mut out, &mul).unwrap();
    assert_eq!(out, 42);
    assert!(matches!(
        reduce_local_into(&2i32, &mut out, &add),
        Err(Error::InvalidHandle)
    ));
    mul.free().unwrap();
}

#[test]
fn a_reused_slot_does_not_resurrect_old_handles() {
    let _guard = lock();
    let stale = UserOperation::commutative(identity).unwrap();
    stale.free().unwrap();
    // the replacement likely lands in the very slot just vacated
    let fresh = UserOperation::commutative(identity).unwrap();
    assert!(matches!(stale.is_commutative(), Err(Error::InvalidHandle)));
    assert!(matches!(stale.free(), Err(Error::InvalidHandle)));
    assert!(fresh.is_commutative().unwrap());
    fresh.free().unwrap();
}

#[test]
fn opaque_operations_combine_raw_bytes() {
    let _guard = lock();
    let xor = UserOperation::new_opaque(true, |input, inout| {
        for (a, b) in input.iter().zip(inout.iter_mut()) {
            *b ^= *a;
        }
        Ok(())
    })
    .unwrap();
    let mut state = [0b1010u8, 0b0110];
    reduce_local_opaque_into(&[0b0011, 0b0101], &mut state, &xor).unwrap();
    assert_eq!(state, [0b1001, 0b0011]);

    // no element type was supplied, so the typed entry point refuses it
    let mut typed = 0u8;
    assert!(matches!(
        reduce_local_into(&0u8, &mut typed, &xor),
        Err(Error::Unsupported(_))
    ));
    xor.free().unwrap();
}

#[test]
fn predefined_operations_never_occupy_registry_slots() {
    let _guard = lock();
    let all: Vec<UserOperation> = (0..MAX_USER_OPERATIONS)
        .map(|_| UserOperation::commutative(identity).unwrap())
        .collect();
    // a full registry leaves the predefined operations usable
    let mut out = 1i32;
    reduce_local_into(&2i32, &mut out, SystemOperation::Sum).unwrap();
    assert_eq!(out, 3);
    for op in all {
        op.free().unwrap();
    }
}
