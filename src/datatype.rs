//! Describing data
//!
//! The collective patterns move typed data between processes. A buffer
//! descriptor records the shape of a memory region without interpreting it:
//! an element count, an element type tag drawn from a fixed enumeration, and
//! optionally a derived layout that selects a non-contiguous subset of the
//! underlying storage.
//!
//! A direct relationship between a Rust type and an element type tag is
//! covered by the [`Equivalence`] trait, which also supplies the packed
//! native-endian representation used on the wire (the transport beneath this
//! layer is assumed homogeneous). The [`Buffer`] and [`BufferMut`] traits
//! are implemented for single values and slices of equivalent types, for
//! [`View`]s combining a slice with an [`IndexedBlock`] layout, and for the
//! dynamically typed [`DynBuffer`]/[`DynBufferMut`] pair that user-defined
//! reduction callbacks receive.
//!
//! Constructing a descriptor never touches the referenced memory; only
//! `pack` and `unpack` do.

use std::mem;

use conv::ConvUtil;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::topology::Rank;
use crate::Count;

/// The fixed enumeration of element types understood by the reduction
/// engine.
///
/// The `*Loc` variants tag value/location pairs as used by the
/// [`MinLocation`](crate::operation::SystemOperation::MinLocation) and
/// [`MaxLocation`](crate::operation::SystemOperation::MaxLocation)
/// operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElementType {
    /// 8-bit signed integer
    Int8,
    /// 16-bit signed integer
    Int16,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 8-bit unsigned integer
    Uint8,
    /// 16-bit unsigned integer
    Uint16,
    /// 32-bit unsigned integer
    Uint32,
    /// 64-bit unsigned integer
    Uint64,
    /// Single precision float
    Float32,
    /// Double precision float
    Float64,
    /// Boolean
    Bool,
    /// An uninterpreted byte
    Byte,
    /// `(i32, location)` pair
    Int32Loc,
    /// `(i64, location)` pair
    Int64Loc,
    /// `(f32, location)` pair
    Float32Loc,
    /// `(f64, location)` pair
    Float64Loc,
}

impl ElementType {
    /// The packed width of one element in bytes.
    pub fn extent(self) -> usize {
        use ElementType::*;
        match self {
            Int8 | Uint8 | Bool | Byte => 1,
            Int16 | Uint16 => 2,
            Int32 | Uint32 | Float32 => 4,
            Int64 | Uint64 | Float64 => 8,
            Int32Loc | Float32Loc => 4 + mem::size_of::<Rank>(),
            Int64Loc | Float64Loc => 8 + mem::size_of::<Rank>(),
        }
    }

    /// Whether this is a fixed-width integer type.
    pub fn is_integer(self) -> bool {
        use ElementType::*;
        matches!(
            self,
            Int8 | Int16 | Int32 | Int64 | Uint8 | Uint16 | Uint32 | Uint64
        )
    }

    /// Whether this is a floating point type.
    pub fn is_float(self) -> bool {
        matches!(self, ElementType::Float32 | ElementType::Float64)
    }

    /// Whether this is a value/location pair type.
    pub fn is_pair(self) -> bool {
        use ElementType::*;
        matches!(self, Int32Loc | Int64Loc | Float32Loc | Float64Loc)
    }
}

/// A direct equivalence exists between the implementing Rust type and an
/// element type tag.
///
/// Implementors also define the element's packed representation; packing is
/// native-endian since byte-order translation is outside the scope of this
/// layer.
pub trait Equivalence: Copy + 'static {
    /// The element type tag equivalent to this Rust type.
    fn equivalent_type() -> ElementType;

    /// Appends the packed representation of this element to `out`.
    fn pack_into(&self, out: &mut Vec<u8>);

    /// Decodes one element from the first
    /// [`extent()`](ElementType::extent) bytes of `bytes`.
    fn unpack_from(bytes: &[u8]) -> Self;
}

macro_rules! equivalent_element_type {
    ($($t:ty => $tag:ident),*) => ($(
        impl Equivalence for $t {
            fn equivalent_type() -> ElementType {
                ElementType::$tag
            }

            fn pack_into(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }

            fn unpack_from(bytes: &[u8]) -> Self {
                let mut raw = [0u8; mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..mem::size_of::<$t>()]);
                <$t>::from_ne_bytes(raw)
            }
        }
    )*)
}

equivalent_element_type! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    f32 => Float32,
    f64 => Float64
}

impl Equivalence for bool {
    fn equivalent_type() -> ElementType {
        ElementType::Bool
    }

    fn pack_into(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn unpack_from(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// A value paired with an opaque location identifier, the operand type of
/// the min-location and max-location reduction operators.
///
/// Pairs are compared by value first; equal values resolve to the pair with
/// the smaller location, for both operators. The deterministic tie-break is
/// part of the reduction contract, not an implementation detail.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Loc<T> {
    /// The value being reduced
    pub value: T,
    /// The tie-breaking location, commonly a rank or index
    pub location: Rank,
}

impl<T> Loc<T> {
    /// A value/location pair.
    pub fn new(value: T, location: Rank) -> Self {
        Loc { value, location }
    }
}

macro_rules! equivalent_loc_type {
    ($($t:ty => $tag:ident),*) => ($(
        impl Equivalence for Loc<$t> {
            fn equivalent_type() -> ElementType {
                ElementType::$tag
            }

            fn pack_into(&self, out: &mut Vec<u8>) {
                self.value.pack_into(out);
                self.location.pack_into(out);
            }

            fn unpack_from(bytes: &[u8]) -> Self {
                let split = mem::size_of::<$t>();
                Loc {
                    value: <$t>::unpack_from(&bytes[..split]),
                    location: Rank::unpack_from(&bytes[split..]),
                }
            }
        }
    )*)
}

equivalent_loc_type! {
    i32 => Int32Loc,
    i64 => Int64Loc,
    f32 => Float32Loc,
    f64 => Float64Loc
}

/// A derived layout selecting blocks of a fixed length at an ordered
/// sequence of displacements within a contiguous buffer, e.g. every other
/// element.
///
/// A layout must be committed against the extent of the storage it will
/// describe before it can be used in a [`View`] or [`MutView`]; committing
/// validates that no block reaches outside that extent. Freeing is the
/// caller's responsibility through ordinary scope-based drop.
#[derive(Clone, Debug)]
pub struct IndexedBlock {
    blocklength: Count,
    displacements: SmallVec<[Count; 8]>,
    committed: bool,
}

impl IndexedBlock {
    /// A layout of `displacements.len()` blocks of `blocklength` elements
    /// each.
    pub fn new(blocklength: Count, displacements: &[Count]) -> Result<IndexedBlock> {
        if blocklength <= 0 {
            return Err(Error::InvalidArgument("block length must be positive"));
        }
        if displacements.iter().any(|&d| d < 0) {
            return Err(Error::InvalidArgument("negative block displacement"));
        }
        Ok(IndexedBlock {
            blocklength,
            displacements: SmallVec::from_slice(displacements),
            committed: false,
        })
    }

    /// The fixed length of every block.
    pub fn blocklength(&self) -> Count {
        self.blocklength
    }

    /// The ordered block displacements.
    pub fn displacements(&self) -> &[Count] {
        &self.displacements
    }

    /// The number of logical elements the layout selects.
    pub fn count(&self) -> Count {
        let blocks: Count = self
            .displacements
            .len()
            .value_as()
            .expect("number of blocks cannot be expressed as a Count");
        blocks * self.blocklength
    }

    /// Whether [`commit`](IndexedBlock::commit) has validated this layout.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// The smallest storage extent the layout fits in.
    pub fn required_extent(&self) -> Count {
        self.displacements
            .iter()
            .map(|&d| d + self.blocklength)
            .max()
            .unwrap_or(0)
    }

    /// Validates the layout against the declared storage `extent` and
    /// freezes it for use.
    ///
    /// Rejects a layout whose displacements, given the block length, would
    /// read or write outside `extent`.
    pub fn commit(&mut self, extent: Count) -> Result<()> {
        if self.required_extent() > extent {
            return Err(Error::InvalidArgument(
                "indexed block layout exceeds the declared extent",
            ));
        }
        self.committed = true;
        Ok(())
    }
}

/// A buffer descriptor: `count()` elements of `element_type()` that can be
/// packed into their wire representation.
pub trait Buffer {
    /// The logical element count. Never negative; a zero-count buffer
    /// participates in a collective but contributes no elements.
    fn count(&self) -> Count;

    /// The element type tag.
    fn element_type(&self) -> ElementType;

    /// The packed representation of the logical element sequence.
    fn pack(&self) -> Vec<u8>;

    /// The total packed size in bytes.
    fn byte_extent(&self) -> usize {
        self.count() as usize * self.element_type().extent()
    }
}

/// A mutable buffer descriptor that can additionally be overwritten from a
/// packed representation.
pub trait BufferMut: Buffer {
    /// Overwrites the logical element sequence from `bytes`.
    ///
    /// Fails with `LengthMismatch` unless `bytes` holds exactly
    /// [`byte_extent()`](Buffer::byte_extent) bytes.
    fn unpack(&mut self, bytes: &[u8]) -> Result<()>;
}

fn check_extent(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(Error::LengthMismatch { expected, actual });
    }
    Ok(())
}

impl<T: Equivalence> Buffer for T {
    fn count(&self) -> Count {
        1
    }

    fn element_type(&self) -> ElementType {
        T::equivalent_type()
    }

    fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(T::equivalent_type().extent());
        self.pack_into(&mut out);
        out
    }
}

impl<T: Equivalence> BufferMut for T {
    fn unpack(&mut self, bytes: &[u8]) -> Result<()> {
        check_extent(self.byte_extent(), bytes.len())?;
        *self = T::unpack_from(bytes);
        Ok(())
    }
}

impl<T: Equivalence> Buffer for [T] {
    fn count(&self) -> Count {
        self.len()
            .value_as()
            .expect("length of slice cannot be expressed as a Count")
    }

    fn element_type(&self) -> ElementType {
        T::equivalent_type()
    }

    fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_extent());
        for element in self {
            element.pack_into(&mut out);
        }
        out
    }
}

impl<T: Equivalence> BufferMut for [T] {
    fn unpack(&mut self, bytes: &[u8]) -> Result<()> {
        check_extent(self.byte_extent(), bytes.len())?;
        let extent = T::equivalent_type().extent();
        for (element, chunk) in self.iter_mut().zip(bytes.chunks_exact(extent)) {
            *element = T::unpack_from(chunk);
        }
        Ok(())
    }
}

/// An immutable view of a slice through a committed [`IndexedBlock`]
/// layout.
pub struct View<'a, T: Equivalence> {
    buffer: &'a [T],
    layout: &'a IndexedBlock,
}

fn check_layout<T>(buffer: &[T], layout: &IndexedBlock) -> Result<()> {
    if !layout.is_committed() {
        return Err(Error::InvalidArgument(
            "indexed block layout must be committed before use",
        ));
    }
    if layout.required_extent() as usize > buffer.len() {
        return Err(Error::InvalidArgument(
            "indexed block layout exceeds the buffer extent",
        ));
    }
    Ok(())
}

impl<'a, T: Equivalence> View<'a, T> {
    /// A view of `buffer` selecting the elements described by `layout`.
    pub fn new(buffer: &'a [T], layout: &'a IndexedBlock) -> Result<View<'a, T>> {
        check_layout(buffer, layout)?;
        Ok(View { buffer, layout })
    }
}

impl<'a, T: Equivalence> Buffer for View<'a, T> {
    fn count(&self) -> Count {
        self.layout.count()
    }

    fn element_type(&self) -> ElementType {
        T::equivalent_type()
    }

    fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_extent());
        let blocklength = self.layout.blocklength() as usize;
        for &displacement in self.layout.displacements() {
            let start = displacement as usize;
            for element in &self.buffer[start..start + blocklength] {
                element.pack_into(&mut out);
            }
        }
        out
    }
}

/// A mutable view of a slice through a committed [`IndexedBlock`] layout.
///
/// Unpacking writes only the selected elements; everything outside the
/// layout is left untouched.
pub struct MutView<'a, T: Equivalence> {
    buffer: &'a mut [T],
    layout: &'a IndexedBlock,
}

impl<'a, T: Equivalence> MutView<'a, T> {
    /// A mutable view of `buffer` selecting the elements described by
    /// `layout`.
    pub fn new(buffer: &'a mut [T], layout: &'a IndexedBlock) -> Result<MutView<'a, T>> {
        check_layout(buffer, layout)?;
        Ok(MutView { buffer, layout })
    }
}

impl<'a, T: Equivalence> Buffer for MutView<'a, T> {
    fn count(&self) -> Count {
        self.layout.count()
    }

    fn element_type(&self) -> ElementType {
        T::equivalent_type()
    }

    fn pack(&self) -> Vec<u8> {
        View {
            buffer: self.buffer,
            layout: self.layout,
        }
        .pack()
    }
}

impl<'a, T: Equivalence> BufferMut for MutView<'a, T> {
    fn unpack(&mut self, bytes: &[u8]) -> Result<()> {
        check_extent(self.byte_extent(), bytes.len())?;
        let extent = T::equivalent_type().extent();
        let blocklength = self.layout.blocklength() as usize;
        let mut chunks = bytes.chunks_exact(extent);
        for &displacement in self.layout.displacements() {
            let start = displacement as usize;
            for element in &mut self.buffer[start..start + blocklength] {
                *element = T::unpack_from(chunks.next().expect("layout count mismatch"));
            }
        }
        Ok(())
    }
}

/// A dynamically typed buffer: a packed byte region together with its
/// element count and type tag.
///
/// This is the operand type handed to user-defined reduction callbacks
/// registered under the typed calling convention.
#[derive(Copy, Clone)]
pub struct DynBuffer<'a> {
    bytes: &'a [u8],
    count: Count,
    element_type: ElementType,
}

impl<'a> DynBuffer<'a> {
    /// A dynamically typed buffer over `bytes`.
    pub fn new(bytes: &'a [u8], count: Count, element_type: ElementType) -> Result<DynBuffer<'a>> {
        if count < 0 {
            return Err(Error::InvalidArgument("negative element count"));
        }
        check_extent(count as usize * element_type.extent(), bytes.len())?;
        Ok(DynBuffer {
            bytes,
            count,
            element_type,
        })
    }

    /// The element type tag.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// The element count.
    pub fn count(&self) -> Count {
        self.count
    }

    /// The packed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Decodes the elements as `T`.
    ///
    /// Fails with `InvalidArgument` when `T` does not match the recorded
    /// element type.
    pub fn decode<T: Equivalence>(&self) -> Result<Vec<T>> {
        if T::equivalent_type() != self.element_type {
            return Err(Error::InvalidArgument("element type mismatch in decode"));
        }
        let extent = self.element_type.extent();
        Ok(self
            .bytes
            .chunks_exact(extent)
            .map(T::unpack_from)
            .collect())
    }
}

/// The mutable counterpart of [`DynBuffer`].
pub struct DynBufferMut<'a> {
    bytes: &'a mut [u8],
    count: Count,
    element_type: ElementType,
}

impl<'a> DynBufferMut<'a> {
    /// A mutable dynamically typed buffer over `bytes`.
    pub fn new(
        bytes: &'a mut [u8],
        count: Count,
        element_type: ElementType,
    ) -> Result<DynBufferMut<'a>> {
        if count < 0 {
            return Err(Error::InvalidArgument("negative element count"));
        }
        check_extent(count as usize * element_type.extent(), bytes.len())?;
        Ok(DynBufferMut {
            bytes,
            count,
            element_type,
        })
    }

    /// The element type tag.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// The element count.
    pub fn count(&self) -> Count {
        self.count
    }

    /// The packed bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// The packed bytes, mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// An immutable reborrow of this buffer.
    pub fn reborrow(&self) -> DynBuffer<'_> {
        DynBuffer {
            bytes: self.bytes,
            count: self.count,
            element_type: self.element_type,
        }
    }

    /// Decodes the elements as `T`. See [`DynBuffer::decode`].
    pub fn decode<T: Equivalence>(&self) -> Result<Vec<T>> {
        self.reborrow().decode()
    }

    /// Overwrites the buffer with the packed representation of `values`.
    ///
    /// Fails with `InvalidArgument` on an element type mismatch and
    /// `LengthMismatch` when `values` does not hold exactly
    /// [`count()`](DynBufferMut::count) elements.
    pub fn encode<T: Equivalence>(&mut self, values: &[T]) -> Result<()> {
        if T::equivalent_type() != self.element_type {
            return Err(Error::InvalidArgument("element type mismatch in encode"));
        }
        if values.len() != self.count as usize {
            return Err(Error::LengthMismatch {
                expected: self.count as usize,
                actual: values.len(),
            });
        }
        let mut out = Vec::with_capacity(self.bytes.len());
        for value in values {
            value.pack_into(&mut out);
        }
        self.bytes.copy_from_slice(&out);
        Ok(())
    }
}

impl<'a> Buffer for DynBuffer<'a> {
    fn count(&self) -> Count {
        self.count
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn pack(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl<'a> Buffer for DynBufferMut<'a> {
    fn count(&self) -> Count {
        self.count
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }

    fn pack(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl<'a> BufferMut for DynBufferMut<'a> {
    fn unpack(&mut self, bytes: &[u8]) -> Result<()> {
        check_extent(self.bytes.len(), bytes.len())?;
        self.bytes.copy_from_slice(bytes);
        Ok(())
    }
}

/// A buffer partitioned into per-rank regions of varying counts, used by
/// the varying-count all-to-all exchange.
pub struct Partition<'a, B: 'a + ?Sized> {
    buffer: &'a B,
    counts: SmallVec<[Count; 8]>,
}

fn check_counts(total: Count, counts: &[Count]) -> Result<()> {
    if counts.iter().any(|&c| c < 0) {
        return Err(Error::InvalidArgument("negative partition count"));
    }
    let sum: Count = counts.iter().sum();
    if sum != total {
        return Err(Error::LengthMismatch {
            expected: total as usize,
            actual: sum as usize,
        });
    }
    Ok(())
}

impl<'a, B: 'a + Buffer + ?Sized> Partition<'a, B> {
    /// Partitions `buffer` into `counts.len()` consecutive regions where
    /// region `i` holds `counts[i]` elements.
    ///
    /// The counts must be non-negative and sum to the buffer's count.
    pub fn new(buffer: &'a B, counts: &[Count]) -> Result<Partition<'a, B>> {
        check_counts(buffer.count(), counts)?;
        Ok(Partition {
            buffer,
            counts: SmallVec::from_slice(counts),
        })
    }

    /// The per-region element counts.
    pub fn counts(&self) -> &[Count] {
        &self.counts
    }

    pub(crate) fn buffer(&self) -> &B {
        self.buffer
    }
}

/// The mutable counterpart of [`Partition`].
pub struct PartitionMut<'a, B: 'a + ?Sized> {
    buffer: &'a mut B,
    counts: SmallVec<[Count; 8]>,
}

impl<'a, B: 'a + BufferMut + ?Sized> PartitionMut<'a, B> {
    /// Partitions `buffer` mutably. See [`Partition::new`].
    pub fn new(buffer: &'a mut B, counts: &[Count]) -> Result<PartitionMut<'a, B>> {
        check_counts(buffer.count(), counts)?;
        Ok(PartitionMut {
            buffer,
            counts: SmallVec::from_slice(counts),
        })
    }

    /// The per-region element counts.
    pub fn counts(&self) -> &[Count] {
        &self.counts
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut B {
        self.buffer
    }

    pub(crate) fn buffer(&self) -> &B {
        self.buffer
    }
}
