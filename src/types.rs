//! Core value types stored in a reftable: object ids, reference records,
//! reflog entries, and committer identities.

use std::fmt;

use crate::error::Result;
use crate::errformat;

/// Length in bytes of an object id.
pub const OBJECT_ID_LEN: usize = 20;

/// A fixed-width opaque object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// The all-zero id, used as the absent side of a reflog transition.
    pub fn zero() -> Self {
        ObjectId([0; OBJECT_ID_LEN])
    }

    pub fn from_raw(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        ObjectId(bytes)
    }

    /// Builds an id from a slice, which must be exactly twenty bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != OBJECT_ID_LEN {
            return errformat!("object id must be {OBJECT_ID_LEN} bytes, got {}", bytes.len());
        }
        let mut raw = [0; OBJECT_ID_LEN];
        raw.copy_from_slice(bytes);
        Ok(ObjectId(raw))
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; OBJECT_ID_LEN]
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

/// Committer identity attached to a reflog entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub time: i64,
    /// Timezone offset in minutes east of UTC.
    pub tz_offset: i16,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, time: i64, tz_offset: i16) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            time,
            tz_offset,
        }
    }
}

/// The value a reference resolves to.
///
/// `Unpeeled` exists only at the API boundary: a caller that has not peeled
/// an annotated tag may hold one, but the writer refuses to serialize it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefValue {
    /// A tombstone marking deletion of the name.
    Deletion,
    /// A direct reference to a non-tag object.
    Direct(ObjectId),
    /// An annotated tag together with the object it peels to.
    Tag { id: ObjectId, peeled: ObjectId },
    /// A reference whose peel status is unknown. Not serializable.
    Unpeeled(ObjectId),
    /// A symbolic reference to another ref name.
    Symbolic(String),
}

/// One reference record: a name, its value, and the transaction that last
/// touched it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ref {
    pub name: String,
    pub value: RefValue,
    pub update_index: u64,
}

impl Ref {
    pub fn direct(name: impl Into<String>, id: ObjectId, update_index: u64) -> Self {
        Self {
            name: name.into(),
            value: RefValue::Direct(id),
            update_index,
        }
    }

    pub fn tag(name: impl Into<String>, id: ObjectId, peeled: ObjectId, update_index: u64) -> Self {
        Self {
            name: name.into(),
            value: RefValue::Tag { id, peeled },
            update_index,
        }
    }

    pub fn unpeeled(name: impl Into<String>, id: ObjectId, update_index: u64) -> Self {
        Self {
            name: name.into(),
            value: RefValue::Unpeeled(id),
            update_index,
        }
    }

    pub fn symbolic(name: impl Into<String>, target: impl Into<String>, update_index: u64) -> Self {
        Self {
            name: name.into(),
            value: RefValue::Symbolic(target.into()),
            update_index,
        }
    }

    pub fn tombstone(name: impl Into<String>, update_index: u64) -> Self {
        Self {
            name: name.into(),
            value: RefValue::Deletion,
            update_index,
        }
    }

    /// The object this ref points at, if it points at one directly.
    pub fn object_id(&self) -> Option<&ObjectId> {
        match &self.value {
            RefValue::Direct(id) | RefValue::Unpeeled(id) | RefValue::Tag { id, .. } => Some(id),
            RefValue::Deletion | RefValue::Symbolic(_) => None,
        }
    }

    /// The peeled object of an annotated tag.
    pub fn peeled_id(&self) -> Option<&ObjectId> {
        match &self.value {
            RefValue::Tag { peeled, .. } => Some(peeled),
            _ => None,
        }
    }

    /// The target name of a symbolic ref.
    pub fn symbolic_target(&self) -> Option<&str> {
        match &self.value {
            RefValue::Symbolic(target) => Some(target),
            _ => None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self.value, RefValue::Symbolic(_))
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.value, RefValue::Deletion)
    }
}

/// The payload of one reflog update event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub who: Signature,
    pub message: String,
}

/// One reflog record as surfaced by a log cursor. `entry` is `None` for a
/// log tombstone marking deletion of history at this update index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    pub name: String,
    pub update_index: u64,
    pub entry: Option<LogEntry>,
}
