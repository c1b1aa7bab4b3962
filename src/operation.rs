//! Reduction operations
//!
//! An operation combines two same-shaped buffers element-wise, storing the
//! result in the second. The predefined identities in [`SystemOperation`]
//! are evaluated natively by the engine; [`UserOperation`] handles wrap
//! caller-supplied combining functions registered in a process-wide,
//! capacity-bounded registry.
//!
//! User operations come in two calling conventions. Under the *typed*
//! convention the callback receives [`DynBuffer`]/[`DynBufferMut`] operands
//! carrying a concrete element type tag; this is the convention the
//! collective reduction patterns use. Under the *object-pair* convention
//! the callback receives two opaque byte sequences and no type information.
//! The evaluator routes to whichever convention the call site implies, and a
//! mismatch is reported as [`Error::Unsupported`] instead of guessing at the
//! memory's meaning.
//!
//! Overflow policy: integer `Sum` and `Product` wrap around, the behavior of
//! the underlying two's-complement arithmetic. Callers needing saturation
//! or fault-on-overflow should register a user operation.

use std::ops::{Add, BitAnd, BitOr, BitXor, Mul};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use once_cell::sync::Lazy;

use crate::datatype::{Buffer, BufferMut, DynBuffer, DynBufferMut, ElementType, Equivalence, Loc};
use crate::error::{Error, Result};
use crate::Count;

/// The maximum number of simultaneously live user-defined operations.
pub const MAX_USER_OPERATIONS: usize = 32;

/// A predefined reduction operation.
///
/// All predefined operations are commutative; their commutativity is fixed
/// by identity and never inferred from behavior.
///
/// With operands `(input, inout)`, `Replace` yields the second operand
/// unchanged by the first and `NoOp` yields the first operand, ignoring the
/// second.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SystemOperation {
    /// Element-wise maximum
    Max,
    /// Element-wise minimum
    Min,
    /// Element-wise sum; integer overflow wraps
    Sum,
    /// Element-wise product; integer overflow wraps
    Product,
    /// Logical conjunction of boolean-coercible elements
    LogicalAnd,
    /// Logical disjunction of boolean-coercible elements
    LogicalOr,
    /// Logical exclusive disjunction of boolean-coercible elements
    LogicalXor,
    /// Bitwise conjunction of integral elements
    BitwiseAnd,
    /// Bitwise disjunction of integral elements
    BitwiseOr,
    /// Bitwise exclusive disjunction of integral elements
    BitwiseXor,
    /// Yields the second operand
    Replace,
    /// Yields the first operand
    NoOp,
    /// Minimum by value over value/location pairs; ties prefer the smaller
    /// location
    MinLocation,
    /// Maximum by value over value/location pairs; ties prefer the smaller
    /// location
    MaxLocation,
}

/// An operation handle as accepted by the reduction-family collective
/// patterns.
///
/// The default value is the null operation, which counts as predefined,
/// compares equal to itself only, and fails with
/// [`Error::InvalidArgument`] anywhere it would be evaluated.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Op {
    /// The null operation
    #[default]
    Null,
    /// A predefined operation
    System(SystemOperation),
    /// A user-defined operation
    User(UserOperation),
}

impl Op {
    /// Whether this is the null operation.
    pub fn is_null(&self) -> bool {
        matches!(self, Op::Null)
    }

    /// Whether this operation is predefined rather than user-registered.
    ///
    /// The null operation counts as predefined.
    pub fn is_predefined(&self) -> bool {
        !matches!(self, Op::User(_))
    }

    /// Whether this operation is commutative.
    ///
    /// Reads the flag recorded at creation time (or fixed by identity for
    /// predefined operations); fails for the null operation and for
    /// released user handles.
    pub fn is_commutative(&self) -> Result<bool> {
        match self {
            Op::Null => Err(Error::InvalidArgument(
                "the null operation has no commutativity",
            )),
            Op::System(_) => Ok(true),
            Op::User(user) => user.is_commutative(),
        }
    }

    /// Verifies the operation may be evaluated: not null and, for user
    /// operations, still live.
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            Op::Null => Err(Error::InvalidArgument(
                "the null operation cannot be evaluated",
            )),
            Op::System(_) => Ok(()),
            Op::User(user) => user.lookup().map(|_| ()),
        }
    }
}

impl From<SystemOperation> for Op {
    fn from(op: SystemOperation) -> Op {
        Op::System(op)
    }
}

impl From<UserOperation> for Op {
    fn from(op: UserOperation) -> Op {
        Op::User(op)
    }
}

/// Something usable as the operation argument of a reduction or scan.
pub trait Operation {
    /// The operation handle.
    fn op(&self) -> Op;

    /// Whether the operation is commutative. See [`Op::is_commutative`].
    fn is_commutative(&self) -> Result<bool> {
        self.op().is_commutative()
    }

    /// Whether the operation is predefined. See [`Op::is_predefined`].
    fn is_predefined(&self) -> bool {
        self.op().is_predefined()
    }
}

impl Operation for Op {
    fn op(&self) -> Op {
        *self
    }
}

impl Operation for SystemOperation {
    fn op(&self) -> Op {
        Op::System(*self)
    }
}

impl Operation for UserOperation {
    fn op(&self) -> Op {
        Op::User(*self)
    }
}

impl<'a, T: 'a + Operation> Operation for &'a T {
    fn op(&self) -> Op {
        (**self).op()
    }
}

type TypedFn = dyn Fn(DynBuffer<'_>, DynBufferMut<'_>) -> Result<()> + Send + Sync;
type OpaqueFn = dyn Fn(&[u8], &mut [u8]) -> Result<()> + Send + Sync;

#[derive(Clone)]
enum Callback {
    Typed(Arc<TypedFn>),
    Opaque(Arc<OpaqueFn>),
}

#[derive(Clone)]
struct Entry {
    callback: Callback,
    commutative: bool,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

// Process-wide arena of operator slots. Slot allocation is O(1) in the
// number of slots and race-free behind the mutex; callbacks run with the
// lock released.
static REGISTRY: Lazy<Mutex<Vec<Slot>>> = Lazy::new(|| {
    Mutex::new(
        (0..MAX_USER_OPERATIONS)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect(),
    )
});

/// A handle to a user-defined operation.
///
/// Handles are small copyable values indexing a process-wide registry of at
/// most [`MAX_USER_OPERATIONS`] live operations. Releasing a handle with
/// [`free`](UserOperation::free) invalidates it and every copy of it; the
/// slot's generation counter guards against use after release even once the
/// slot has been reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UserOperation {
    index: u32,
    generation: u32,
}

impl UserOperation {
    /// Registers an operation under the typed calling convention.
    ///
    /// The callback receives operands `(input, inout)` as dynamically typed
    /// buffers of equal count and element type and must store the combined
    /// result in `inout`. Errors returned by the callback propagate to the
    /// caller of the reduction unchanged.
    ///
    /// Commutativity is exactly what the caller declares here; it is never
    /// inferred.
    pub fn new<F>(commutative: bool, function: F) -> Result<UserOperation>
    where
        F: Fn(DynBuffer<'_>, DynBufferMut<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::register(Callback::Typed(Arc::new(function)), commutative)
    }

    /// Registers a commutative operation under the typed convention.
    pub fn commutative<F>(function: F) -> Result<UserOperation>
    where
        F: Fn(DynBuffer<'_>, DynBufferMut<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(true, function)
    }

    /// Registers a non-commutative (merely associative) operation under the
    /// typed convention. Reduction patterns apply it in ascending rank
    /// order.
    pub fn associative<F>(function: F) -> Result<UserOperation>
    where
        F: Fn(DynBuffer<'_>, DynBufferMut<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(false, function)
    }

    /// Registers an operation under the object-pair calling convention.
    ///
    /// The callback receives two opaque byte sequences of equal length and
    /// must store the combined result in the second. Such an operation can
    /// only be invoked through
    /// [`reduce_local_opaque_into`]; presenting it with a concrete element
    /// type is `Unsupported`.
    pub fn new_opaque<F>(commutative: bool, function: F) -> Result<UserOperation>
    where
        F: Fn(&[u8], &mut [u8]) -> Result<()> + Send + Sync + 'static,
    {
        Self::register(Callback::Opaque(Arc::new(function)), commutative)
    }

    fn register(callback: Callback, commutative: bool) -> Result<UserOperation> {
        let mut slots = REGISTRY.lock().expect("operation registry lock poisoned");
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.entry.is_none() {
                slot.entry = Some(Entry {
                    callback,
                    commutative,
                });
                debug!("registered user operation in slot {}", index);
                return Ok(UserOperation {
                    index: index as u32,
                    generation: slot.generation,
                });
            }
        }
        Err(Error::ResourceExhausted(MAX_USER_OPERATIONS))
    }

    /// Releases the operation, invalidating this handle and all copies of
    /// it and freeing the registry slot for reuse.
    ///
    /// Releasing an already-released handle fails with `InvalidHandle`.
    pub fn free(self) -> Result<()> {
        let mut slots = REGISTRY.lock().expect("operation registry lock poisoned");
        let slot = &mut slots[self.index as usize];
        if slot.generation != self.generation || slot.entry.is_none() {
            return Err(Error::InvalidHandle);
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        trace!("freed user operation slot {}", self.index);
        Ok(())
    }

    /// Whether the operation was declared commutative at creation.
    pub fn is_commutative(&self) -> Result<bool> {
        self.lookup().map(|entry| entry.commutative)
    }

    fn lookup(&self) -> Result<Entry> {
        let slots = REGISTRY.lock().expect("operation registry lock poisoned");
        let slot = &slots[self.index as usize];
        if slot.generation != self.generation {
            return Err(Error::InvalidHandle);
        }
        slot.entry.clone().ok_or(Error::InvalidHandle)
    }
}

/// Performs a local reduction under the typed calling convention: combines
/// `inbuf` into `inoutbuf` element-wise and leaves the result in
/// `inoutbuf`.
///
/// The operand element types must agree (`InvalidArgument`) and so must
/// their counts (`LengthMismatch`). Predefined operations are evaluated
/// natively; typed user operations are invoked with dynamically typed
/// views of the operands; an object-pair-only user operation here is
/// `Unsupported`.
pub fn reduce_local_into<S, R, O>(inbuf: &S, inoutbuf: &mut R, op: O) -> Result<()>
where
    S: Buffer + ?Sized,
    R: BufferMut + ?Sized,
    O: Operation,
{
    let op = op.op();
    if inbuf.element_type() != inoutbuf.element_type() {
        return Err(Error::InvalidArgument("operand element types disagree"));
    }
    if inbuf.count() != inoutbuf.count() {
        return Err(Error::LengthMismatch {
            expected: inoutbuf.count() as usize,
            actual: inbuf.count() as usize,
        });
    }
    let invec = inbuf.pack();
    let mut inoutvec = inoutbuf.pack();
    reduce_packed(
        &invec,
        &mut inoutvec,
        inoutbuf.element_type(),
        inoutbuf.count(),
        op,
    )?;
    inoutbuf.unpack(&inoutvec)
}

/// Performs a local reduction under the object-pair calling convention:
/// combines the opaque sequence `invec` into `inoutvec`.
///
/// Only user operations registered with
/// [`UserOperation::new_opaque`] can be invoked this way; predefined and
/// typed user operations are `Unsupported` without a concrete element
/// type.
pub fn reduce_local_opaque_into<O: Operation>(
    invec: &[u8],
    inoutvec: &mut [u8],
    op: O,
) -> Result<()> {
    match op.op() {
        Op::Null => Err(Error::InvalidArgument(
            "the null operation cannot be evaluated",
        )),
        Op::System(_) => Err(Error::Unsupported(
            "predefined operations require a concrete element type",
        )),
        Op::User(user) => {
            let entry = user.lookup()?;
            match entry.callback {
                Callback::Opaque(function) => {
                    if invec.len() != inoutvec.len() {
                        return Err(Error::LengthMismatch {
                            expected: inoutvec.len(),
                            actual: invec.len(),
                        });
                    }
                    function(invec, inoutvec)
                }
                Callback::Typed(_) => Err(Error::Unsupported(
                    "operation uses the typed convention but no element type was supplied",
                )),
            }
        }
    }
}

/// Combines the packed operand `invec` into `inoutvec`. Internal entry
/// point of the evaluator used by the collective dispatch.
pub(crate) fn reduce_packed(
    invec: &[u8],
    inoutvec: &mut [u8],
    element_type: ElementType,
    count: Count,
    op: Op,
) -> Result<()> {
    let expected = count as usize * element_type.extent();
    if invec.len() != expected {
        return Err(Error::LengthMismatch {
            expected,
            actual: invec.len(),
        });
    }
    if inoutvec.len() != expected {
        return Err(Error::LengthMismatch {
            expected,
            actual: inoutvec.len(),
        });
    }
    match op {
        Op::Null => Err(Error::InvalidArgument(
            "the null operation cannot be evaluated",
        )),
        Op::System(system) => reduce_system(invec, inoutvec, element_type, count, system),
        Op::User(user) => {
            let entry = user.lookup()?;
            match entry.callback {
                Callback::Typed(function) => {
                    let input = DynBuffer::new(invec, count, element_type)?;
                    let inout = DynBufferMut::new(inoutvec, count, element_type)?;
                    function(input, inout)
                }
                Callback::Opaque(_) => Err(Error::Unsupported(
                    "operation uses the object-pair convention but a concrete element type was supplied",
                )),
            }
        }
    }
}

fn reduce_system(
    invec: &[u8],
    inoutvec: &mut [u8],
    element_type: ElementType,
    count: Count,
    op: SystemOperation,
) -> Result<()> {
    use ElementType::*;
    match element_type {
        Int8 => combine_integer::<i8>(invec, inoutvec, count, op),
        Int16 => combine_integer::<i16>(invec, inoutvec, count, op),
        Int32 => combine_integer::<i32>(invec, inoutvec, count, op),
        Int64 => combine_integer::<i64>(invec, inoutvec, count, op),
        Uint8 => combine_integer::<u8>(invec, inoutvec, count, op),
        Uint16 => combine_integer::<u16>(invec, inoutvec, count, op),
        Uint32 => combine_integer::<u32>(invec, inoutvec, count, op),
        Uint64 => combine_integer::<u64>(invec, inoutvec, count, op),
        Float32 => combine_float::<f32>(invec, inoutvec, count, op),
        Float64 => combine_float::<f64>(invec, inoutvec, count, op),
        Bool => combine_bool(invec, inoutvec, count, op),
        Byte => combine_byte(invec, inoutvec, count, op),
        Int32Loc => combine_pair::<i32>(invec, inoutvec, count, op),
        Int64Loc => combine_pair::<i64>(invec, inoutvec, count, op),
        Float32Loc => combine_pair::<f32>(invec, inoutvec, count, op),
        Float64Loc => combine_pair::<f64>(invec, inoutvec, count, op),
    }
}

/// Applies `f` to corresponding elements of the packed operands, storing
/// the result in `inoutvec`.
fn apply<T, F>(invec: &[u8], inoutvec: &mut [u8], count: Count, f: F) -> Result<()>
where
    T: Equivalence,
    F: Fn(T, T) -> T,
{
    let extent = T::equivalent_type().extent();
    for i in 0..count as usize {
        let range = i * extent..(i + 1) * extent;
        let a = T::unpack_from(&invec[range.clone()]);
        let b = T::unpack_from(&inoutvec[range.clone()]);
        let mut packed = Vec::with_capacity(extent);
        f(a, b).pack_into(&mut packed);
        inoutvec[range].copy_from_slice(&packed);
    }
    Ok(())
}

trait IntegerElement:
    Equivalence
    + Ord
    + BitAnd<Output = Self>
    + BitOr<Output = Self>
    + BitXor<Output = Self>
{
    fn wrapping_add(self, other: Self) -> Self;
    fn wrapping_mul(self, other: Self) -> Self;
    fn as_bool(self) -> bool;
    fn from_bool(value: bool) -> Self;
}

macro_rules! integer_element {
    ($($t:ty),*) => ($(
        impl IntegerElement for $t {
            fn wrapping_add(self, other: Self) -> Self {
                <$t>::wrapping_add(self, other)
            }

            fn wrapping_mul(self, other: Self) -> Self {
                <$t>::wrapping_mul(self, other)
            }

            fn as_bool(self) -> bool {
                self != 0
            }

            fn from_bool(value: bool) -> Self {
                value as $t
            }
        }
    )*)
}

integer_element!(i8, i16, i32, i64, u8, u16, u32, u64);

fn combine_integer<T: IntegerElement>(
    invec: &[u8],
    inoutvec: &mut [u8],
    count: Count,
    op: SystemOperation,
) -> Result<()> {
    use SystemOperation::*;
    match op {
        Max => apply::<T, _>(invec, inoutvec, count, |a, b| a.max(b)),
        Min => apply::<T, _>(invec, inoutvec, count, |a, b| a.min(b)),
        Sum => apply::<T, _>(invec, inoutvec, count, |a, b| a.wrapping_add(b)),
        Product => apply::<T, _>(invec, inoutvec, count, |a, b| a.wrapping_mul(b)),
        LogicalAnd => apply::<T, _>(invec, inoutvec, count, |a, b| {
            T::from_bool(a.as_bool() && b.as_bool())
        }),
        LogicalOr => apply::<T, _>(invec, inoutvec, count, |a, b| {
            T::from_bool(a.as_bool() || b.as_bool())
        }),
        LogicalXor => apply::<T, _>(invec, inoutvec, count, |a, b| {
            T::from_bool(a.as_bool() ^ b.as_bool())
        }),
        BitwiseAnd => apply::<T, _>(invec, inoutvec, count, |a, b| a & b),
        BitwiseOr => apply::<T, _>(invec, inoutvec, count, |a, b| a | b),
        BitwiseXor => apply::<T, _>(invec, inoutvec, count, |a, b| a ^ b),
        Replace => apply::<T, _>(invec, inoutvec, count, |_, b| b),
        NoOp => apply::<T, _>(invec, inoutvec, count, |a, _| a),
        MinLocation | MaxLocation => Err(Error::InvalidArgument(
            "min/max-location require value/location pair elements",
        )),
    }
}

trait FloatElement: Equivalence + PartialOrd + Add<Output = Self> + Mul<Output = Self> {}

impl FloatElement for f32 {}
impl FloatElement for f64 {}

fn combine_float<T: FloatElement>(
    invec: &[u8],
    inoutvec: &mut [u8],
    count: Count,
    op: SystemOperation,
) -> Result<()> {
    use SystemOperation::*;
    match op {
        Max => apply::<T, _>(invec, inoutvec, count, |a, b| if b < a { a } else { b }),
        Min => apply::<T, _>(invec, inoutvec, count, |a, b| if a < b { a } else { b }),
        Sum => apply::<T, _>(invec, inoutvec, count, |a, b| a + b),
        Product => apply::<T, _>(invec, inoutvec, count, |a, b| a * b),
        Replace => apply::<T, _>(invec, inoutvec, count, |_, b| b),
        NoOp => apply::<T, _>(invec, inoutvec, count, |a, _| a),
        LogicalAnd | LogicalOr | LogicalXor | BitwiseAnd | BitwiseOr | BitwiseXor => Err(
            Error::InvalidArgument("logical and bitwise operations require integral elements"),
        ),
        MinLocation | MaxLocation => Err(Error::InvalidArgument(
            "min/max-location require value/location pair elements",
        )),
    }
}

fn combine_bool(invec: &[u8], inoutvec: &mut [u8], count: Count, op: SystemOperation) -> Result<()> {
    use SystemOperation::*;
    match op {
        LogicalAnd => apply::<bool, _>(invec, inoutvec, count, |a, b| a && b),
        LogicalOr => apply::<bool, _>(invec, inoutvec, count, |a, b| a || b),
        LogicalXor => apply::<bool, _>(invec, inoutvec, count, |a, b| a ^ b),
        Replace => apply::<bool, _>(invec, inoutvec, count, |_, b| b),
        NoOp => apply::<bool, _>(invec, inoutvec, count, |a, _| a),
        _ => Err(Error::InvalidArgument(
            "operation not defined for boolean elements",
        )),
    }
}

fn combine_byte(invec: &[u8], inoutvec: &mut [u8], count: Count, op: SystemOperation) -> Result<()> {
    use SystemOperation::*;
    match op {
        BitwiseAnd => apply::<u8, _>(invec, inoutvec, count, |a, b| a & b),
        BitwiseOr => apply::<u8, _>(invec, inoutvec, count, |a, b| a | b),
        BitwiseXor => apply::<u8, _>(invec, inoutvec, count, |a, b| a ^ b),
        Replace => apply::<u8, _>(invec, inoutvec, count, |_, b| b),
        NoOp => apply::<u8, _>(invec, inoutvec, count, |a, _| a),
        _ => Err(Error::InvalidArgument(
            "operation not defined for raw byte elements",
        )),
    }
}

fn min_loc<T: PartialOrd>(a: Loc<T>, b: Loc<T>) -> Loc<T> {
    if a.value < b.value {
        a
    } else if b.value < a.value {
        b
    } else if a.location <= b.location {
        a
    } else {
        b
    }
}

fn max_loc<T: PartialOrd>(a: Loc<T>, b: Loc<T>) -> Loc<T> {
    if a.value > b.value {
        a
    } else if b.value > a.value {
        b
    } else if a.location <= b.location {
        a
    } else {
        b
    }
}

fn combine_pair<T>(
    invec: &[u8],
    inoutvec: &mut [u8],
    count: Count,
    op: SystemOperation,
) -> Result<()>
where
    T: PartialOrd + Copy + 'static,
    Loc<T>: Equivalence,
{
    use SystemOperation::*;
    match op {
        MinLocation => apply::<Loc<T>, _>(invec, inoutvec, count, min_loc),
        MaxLocation => apply::<Loc<T>, _>(invec, inoutvec, count, max_loc),
        Replace => apply::<Loc<T>, _>(invec, inoutvec, count, |_, b| b),
        NoOp => apply::<Loc<T>, _>(invec, inoutvec, count, |a, _| a),
        _ => Err(Error::InvalidArgument(
            "operation not defined for value/location pair elements",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn combine<T: Equivalence>(a: T, mut b: T, op: SystemOperation) -> T {
        reduce_local_into(&a, &mut b, op).unwrap();
        b
    }

    #[test]
    fn arithmetic_identities() {
        assert_eq!(combine(2i32, 3, SystemOperation::Min), 2);
        assert_eq!(combine(2i32, 3, SystemOperation::Max), 3);
        assert_eq!(combine(2i32, 3, SystemOperation::Sum), 5);
        assert_eq!(combine(2i32, 3, SystemOperation::Product), 6);
    }

    #[test]
    fn replace_and_no_op() {
        assert_eq!(combine(2i32, 3, SystemOperation::Replace), 3);
        assert_eq!(combine(3i32, 2, SystemOperation::Replace), 2);
        assert_eq!(combine(2i32, 3, SystemOperation::NoOp), 2);
        assert_eq!(combine(3i32, 2, SystemOperation::NoOp), 3);
    }

    #[test]
    fn logical_identities() {
        for x in [false, true] {
            for y in [false, true] {
                assert_eq!(combine(x, y, SystemOperation::LogicalAnd), x && y);
                assert_eq!(combine(x, y, SystemOperation::LogicalOr), x || y);
                assert_eq!(combine(x, y, SystemOperation::LogicalXor), x ^ y);
            }
        }
        // integers coerce; results are stored as 0/1
        assert_eq!(combine(5i16, 0, SystemOperation::LogicalAnd), 0);
        assert_eq!(combine(5i16, 3, SystemOperation::LogicalAnd), 1);
        assert_eq!(combine(0i16, 0, SystemOperation::LogicalOr), 0);
        assert_eq!(combine(5i16, 3, SystemOperation::LogicalXor), 0);
    }

    #[test]
    fn bitwise_identities() {
        for x in 0u32..5 {
            for y in 0u32..5 {
                assert_eq!(combine(x, y, SystemOperation::BitwiseAnd), x & y);
                assert_eq!(combine(x, y, SystemOperation::BitwiseOr), x | y);
                assert_eq!(combine(x, y, SystemOperation::BitwiseXor), x ^ y);
            }
        }
    }

    #[test]
    fn integer_overflow_wraps() {
        assert_eq!(combine(200u8, 100, SystemOperation::Sum), 44);
        assert_eq!(combine(16i8, 16, SystemOperation::Product), 0);
    }

    #[test]
    fn location_pairs_break_ties_by_smaller_location() {
        let a = Loc::new(1.0f64, 2);
        let b = Loc::new(2.0f64, 1);
        assert_eq!(combine(a, b, SystemOperation::MinLocation), a);
        assert_eq!(combine(b, a, SystemOperation::MinLocation), a);
        assert_eq!(combine(a, b, SystemOperation::MaxLocation), b);
        assert_eq!(combine(b, a, SystemOperation::MaxLocation), b);

        let u = Loc::new(1i32, 0);
        let v = Loc::new(1i32, 1);
        assert_eq!(combine(u, v, SystemOperation::MinLocation), u);
        assert_eq!(combine(v, u, SystemOperation::MinLocation), u);
        assert_eq!(combine(u, v, SystemOperation::MaxLocation), u);
        assert_eq!(combine(v, u, SystemOperation::MaxLocation), u);
    }

    #[test]
    fn inadmissible_element_types_are_rejected() {
        let mut b = 1.5f64;
        assert!(matches!(
            reduce_local_into(&0.5f64, &mut b, SystemOperation::BitwiseAnd),
            Err(Error::InvalidArgument(_))
        ));
        let mut flag = true;
        assert!(matches!(
            reduce_local_into(&true, &mut flag, SystemOperation::Sum),
            Err(Error::InvalidArgument(_))
        ));
        let mut n = 1i32;
        assert!(matches!(
            reduce_local_into(&1i32, &mut n, SystemOperation::MinLocation),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn null_operation_cannot_be_evaluated() {
        let op = Op::default();
        assert!(op.is_null());
        assert!(op.is_predefined());
        assert!(matches!(op.is_commutative(), Err(Error::InvalidArgument(_))));
        let mut b = 1i32;
        assert!(matches!(
            reduce_local_into(&1i32, &mut b, op),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn operand_shape_disagreement_is_rejected() {
        let mut wrong_type = [0i64; 2];
        assert!(matches!(
            reduce_local_into(&[1i32, 2][..], &mut wrong_type[..], SystemOperation::Sum),
            Err(Error::InvalidArgument(_))
        ));
        let mut short = [0i32; 1];
        assert!(matches!(
            reduce_local_into(&[1i32, 2][..], &mut short[..], SystemOperation::Sum),
            Err(Error::LengthMismatch { .. })
        ));
    }

    #[test]
    fn typed_user_operation_combines_elementwise() {
        let op = UserOperation::commutative(|input, mut inout| {
            let a: Vec<i32> = input.decode()?;
            let mut b: Vec<i32> = inout.decode()?;
            for (x, y) in a.iter().zip(&mut b) {
                *y += *x;
            }
            inout.encode(&b)
        })
        .unwrap();
        let mut acc = [10i32, 20];
        reduce_local_into(&[1i32, 2][..], &mut acc[..], op).unwrap();
        assert_eq!(acc, [11, 22]);
        assert!(op.is_commutative().unwrap());
        assert!(!Operation::is_predefined(&op));
        op.free().unwrap();
    }

    #[test]
    fn commutativity_is_recorded_not_inferred() {
        // the callback is commutative, the declaration says otherwise
        let op = UserOperation::associative(|input, mut inout| {
            let a: Vec<i32> = input.decode()?;
            let b: Vec<i32> = inout.decode()?;
            let sum: Vec<i32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
            inout.encode(&sum)
        })
        .unwrap();
        assert!(!op.is_commutative().unwrap());
        op.free().unwrap();
    }

    #[test]
    fn released_handles_are_invalid() {
        let op = UserOperation::commutative(|_, _| Ok(())).unwrap();
        let copy = op;
        op.free().unwrap();
        assert!(matches!(copy.is_commutative(), Err(Error::InvalidHandle)));
        assert!(matches!(copy.free(), Err(Error::InvalidHandle)));
        let mut b = 0i32;
        assert!(matches!(
            reduce_local_into(&0i32, &mut b, copy),
            Err(Error::InvalidHandle)
        ));
    }

    #[test]
    fn calling_convention_mismatch_is_unsupported() {
        let opaque = UserOperation::new_opaque(true, |input, inout| {
            for (a, b) in input.iter().zip(inout.iter_mut()) {
                *b ^= *a;
            }
            Ok(())
        })
        .unwrap();
        let mut b = 0i32;
        assert!(matches!(
            reduce_local_into(&0i32, &mut b, opaque),
            Err(Error::Unsupported(_))
        ));

        let typed = UserOperation::commutative(|_, _| Ok(())).unwrap();
        let mut bytes = [0u8; 4];
        assert!(matches!(
            reduce_local_opaque_into(&[1u8, 2, 3, 4], &mut bytes, typed),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            reduce_local_opaque_into(&[0u8; 4], &mut bytes, SystemOperation::Sum),
            Err(Error::Unsupported(_))
        ));

        opaque.free().unwrap();
        typed.free().unwrap();
    }

    #[test]
    fn opaque_invocation_checks_lengths() {
        let op = UserOperation::new_opaque(true, |_, _| Ok(())).unwrap();
        let mut inout = [0u8; 3];
        assert!(matches!(
            reduce_local_opaque_into(&[0u8; 4], &mut inout, op),
            Err(Error::LengthMismatch { .. })
        ));
        op.free().unwrap();
    }

    #[test]
    fn callback_errors_propagate_unchanged() {
        let op = UserOperation::commutative(|_, _| {
            Err(Error::InvalidArgument("callback rejected the operands"))
        })
        .unwrap();
        let mut b = 0i32;
        let err = reduce_local_into(&0i32, &mut b, op).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidArgument("callback rejected the operands")
        ));
        op.free().unwrap();
    }
}
