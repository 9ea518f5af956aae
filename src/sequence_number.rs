use rand::Rng;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};

/// A 27-bit wrapping packet sequence number.
///
/// Sequence numbers live on a circle of size 2^27. Two numbers are comparable through the
///  signed 27-bit delta: `a` is *before* `b` iff the forward distance from `a` to `b` is
///  in `(0, 2^26)`. That makes comparisons meaningful as long as the window of numbers in
///  flight stays below a quarter of the circle, which the flow window guarantees by a wide
///  margin.
///
/// NB: There is deliberately no `Ord` impl - the circular order is not total, and feeding
///      it into an ordered collection would corrupt the collection near the wrap point.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl SequenceNumber {
    /// modulus of the sequence number circle
    pub const MODULUS: u32 = 1 << 27;
    /// half the circle - the horizon for the signed-delta comparison
    const THRESHOLD: u32 = 1 << 26;
    /// largest representable raw value
    pub const MAX_VALUE: u32 = Self::MODULUS - 1;

    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn new(raw: u32) -> SequenceNumber {
        SequenceNumber(raw & Self::MAX_VALUE)
    }

    /// Uniformly random sequence number, drawn at connection creation so an initial number
    ///  doubles as a connection identity during re-handshakes.
    pub fn random() -> SequenceNumber {
        SequenceNumber(rand::thread_rng().gen_range(0..Self::MODULUS))
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> SequenceNumber {
        self + 1
    }

    pub fn prev(self) -> SequenceNumber {
        self - 1
    }

    /// Circular three-way comparison through the signed 27-bit delta.
    pub fn cmp_seq(self, other: SequenceNumber) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        let forward = (other.0.wrapping_sub(self.0)) & Self::MAX_VALUE;
        if forward < Self::THRESHOLD {
            Ordering::Less
        }
        else {
            Ordering::Greater
        }
    }

    pub fn is_before(self, other: SequenceNumber) -> bool {
        self.cmp_seq(other) == Ordering::Less
    }

    pub fn is_after(self, other: SequenceNumber) -> bool {
        self.cmp_seq(other) == Ordering::Greater
    }

    /// Forward distance from `self` to `other`, i.e. the number of increments that lead
    ///  from `self` to `other`.
    pub fn distance_to(self, other: SequenceNumber) -> u32 {
        (other.0.wrapping_sub(self.0)) & Self::MAX_VALUE
    }

    /// Number of sequence numbers in the inclusive interval `[self, other]`, walking
    ///  forward from `self`.
    pub fn span_to(self, other: SequenceNumber) -> u32 {
        self.distance_to(other) + 1
    }

    /// Iterate the inclusive interval `[self, other]` in forward order.
    pub fn to_inclusive(self, other: SequenceNumber) -> impl Iterator<Item = SequenceNumber> {
        (0..self.span_to(other)).map(move |offs| self + offs)
    }
}

impl Add<u32> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(rhs) & Self::MAX_VALUE)
    }
}

impl Sub<u32> for SequenceNumber {
    type Output = SequenceNumber;

    fn sub(self, rhs: u32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(rhs) & Self::MAX_VALUE)
    }
}


/// A 30-bit wrapping number identifying a logical message within a connection.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageNumber(u32);

impl Display for MessageNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MessageNumber {
    pub const MODULUS: u32 = 1 << 30;
    pub const MAX_VALUE: u32 = Self::MODULUS - 1;

    pub const ZERO: MessageNumber = MessageNumber(0);

    pub fn new(raw: u32) -> MessageNumber {
        MessageNumber(raw & Self::MAX_VALUE)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> MessageNumber {
        MessageNumber(self.0.wrapping_add(1) & Self::MAX_VALUE)
    }
}

/// Zero-based index of a packet within a message.
pub type MessagePartNumber = u32;
