//! Provides the immutable byte container in which all cached values travel.
//!
//! Every value managed by a [Group](crate::group::Group) - whether it was produced by the local
//! loader, fetched from a peer or read from the local cache - is wrapped in a [ByteView]. The
//! payload is immutable after construction and reads always yield an independent copy, so a
//! caller can never mutate data which is still referenced by the cache.
use bytes::Bytes;

use crate::lru::ByteSize;

/// An immutable view onto a cached byte payload.
///
/// Cloning a view is cheap (the payload is reference counted) which is what allows the cache to
/// hand out values without copying on every hit. Whenever the raw bytes are actually needed,
/// [to_vec](ByteView::to_vec) produces a defensive copy.
///
/// # Examples
/// ```
/// # use ganymede::byteview::ByteView;
/// let view = ByteView::from("hello");
///
/// assert_eq!(view.len(), 5);
/// assert_eq!(view.to_vec(), b"hello".to_vec());
/// assert_eq!(view.to_string(), "hello");
///
/// // A copy handed out by to_vec is independent of the view...
/// let mut copy = view.to_vec();
/// copy[0] = b'H';
/// assert_eq!(view.to_string(), "hello");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Creates a view by taking ownership of the given bytes.
    pub fn new(data: Vec<u8>) -> Self {
        ByteView { data: data.into() }
    }

    /// Returns the size of the payload in bytes.
    ///
    /// This drives the byte accounting of the cache: an entry contributes the length of its key
    /// plus the length of its value to the memory budget of its group.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a defensive copy of the payload.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl From<&[u8]> for ByteView {
    fn from(data: &[u8]) -> Self {
        ByteView {
            data: Bytes::copy_from_slice(data),
        }
    }
}

impl From<&str> for ByteView {
    fn from(data: &str) -> Self {
        ByteView {
            data: Bytes::copy_from_slice(data.as_bytes()),
        }
    }
}

impl std::fmt::Display for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}

impl std::fmt::Debug for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteView({} bytes)", self.data.len())
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::byteview::ByteView;

    #[test]
    fn reads_are_defensive_copies() {
        let view = ByteView::new(vec![1, 2, 3]);
        let mut copy = view.to_vec();
        copy[0] = 99;

        // The view still contains the original payload...
        assert_eq!(view.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn clones_share_the_payload_but_stay_equal() {
        let view = ByteView::from("shared");
        let clone = view.clone();

        assert_eq!(view, clone);
        assert_eq!(clone.len(), 6);
    }

    #[test]
    fn empty_views_are_reported_as_such() {
        assert_eq!(ByteView::new(Vec::new()).is_empty(), true);
        assert_eq!(ByteView::from("x").is_empty(), false);
    }
}
