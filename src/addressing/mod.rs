//! KNX addressing: group addresses and individual (physical) addresses.

pub mod group;
pub mod individual;

#[doc(inline)]
pub use group::GroupAddress;
#[doc(inline)]
pub use individual::IndividualAddress;
