// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed hand-off of primitive handles from the primary core to the
//! secondary.
//!
//! After the primary core has created its mailboxes, semaphores, and pipes,
//! the secondary needs to learn where they live. Baking raw addresses into
//! both images works but is fragile; instead the boot block reserves a small
//! area where the primary publishes one serialized record, prefixed by a
//! header carrying a version and a magic number. The secondary validates
//! both before trusting a single byte, so a stale or mismatched image fails
//! loudly at boot rather than corrupting memory later.
//!
//! The version comes first in the header so the record type can evolve; the
//! magic follows for visibility in hexdumps.

use hubpack::SerializedSize;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Size of the hand-off area inside the boot block, in bytes. Generous for a
/// table of handle addresses; anything bigger belongs in its own pool
/// allocation, with only its address passed through here.
pub const HANDOFF_AREA: usize = 244;

/// The header that prefixes the serialized record in the hand-off area.
#[derive(Serialize, Deserialize, SerializedSize)]
pub struct HandoffHeader {
    pub version: u32,
    pub magic: [u8; 8],
}

const_assert!(HandoffHeader::MAX_SIZE < HANDOFF_AREA);

/// A record that can pass through the hand-off area.
///
/// Implementers pick a magic number unique to the record type and bump
/// `VERSION` whenever the layout changes incompatibly.
pub trait HandoffData: Serialize + SerializedSize + Sized {
    const VERSION: u32;
    const MAGIC: [u8; 8];
}

/// Error returned when publishing or loading a hand-off record fails.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandoffError {
    /// The record's maximum serialized size exceeds the hand-off area.
    TooBig,
    /// Nothing has been published yet.
    Missing,
    /// The stored version does not match the record type's.
    UnexpectedVersion(u32),
    /// The stored magic does not match the record type's.
    BadMagic,
    /// The stored bytes did not deserialize as the record type.
    Deserialize,
}

impl From<hubpack::Error> for HandoffError {
    fn from(_: hubpack::Error) -> Self {
        HandoffError::Deserialize
    }
}

/// Serializes `value` behind its header into `area`.
pub(crate) fn publish_into<T: HandoffData>(
    area: &mut [u8],
    value: &T,
) -> Result<(), HandoffError> {
    if HandoffHeader::MAX_SIZE + T::MAX_SIZE > area.len() {
        return Err(HandoffError::TooBig);
    }
    let header = HandoffHeader {
        version: T::VERSION,
        magic: T::MAGIC,
    };
    // The size check above makes these serializes infallible, but a short
    // buffer would still be a TooBig condition, not a codec one.
    let n = hubpack::serialize(area, &header)
        .map_err(|_| HandoffError::TooBig)?;
    hubpack::serialize(&mut area[n..], value)
        .map_err(|_| HandoffError::TooBig)?;
    Ok(())
}

/// Deserializes a record of type `T` from `area`, validating the header.
pub(crate) fn load_from<T>(area: &[u8]) -> Result<T, HandoffError>
where
    T: HandoffData,
    for<'d> T: Deserialize<'d>,
{
    let (header, rest) = hubpack::deserialize::<HandoffHeader>(area)?;
    if header.version != T::VERSION {
        return Err(HandoffError::UnexpectedVersion(header.version));
    }
    if header.magic != T::MAGIC {
        return Err(HandoffError::BadMagic);
    }
    let (value, _) = hubpack::deserialize::<T>(rest)?;
    Ok(value)
}
