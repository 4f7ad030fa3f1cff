//! Static and dynamic field tables.
use std::collections::VecDeque;

use bytes::Bytes;

use super::HpackError;

/// One decoded field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct Field {
    pub name: Bytes,
    pub value: Bytes,
}

impl Field {
    pub(super) fn new(name: Bytes, value: Bytes) -> Self {
        Self { name, value }
    }

    /// RFC 7541 section 4.1 size: octets plus 32 per entry.
    fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// RFC 7541 Appendix A, indexes 1 through 61.
pub(super) static STATIC_TABLE: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// The decoder's dynamic table.
#[derive(Debug)]
pub(super) struct DynamicTable {
    fields: VecDeque<Field>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub(super) fn new(max_size: usize) -> Self {
        Self {
            fields: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Looks up a field by its 1-based HPACK index, static table first.
    pub(super) fn get(&self, index: usize) -> Result<Field, HpackError> {
        let index = index.checked_sub(1).ok_or(HpackError::BadIndex)?;
        if let Some(&(name, value)) = STATIC_TABLE.get(index) {
            return Ok(Field::new(Bytes::from_static(name), Bytes::from_static(value)));
        }
        self.fields
            .get(index - STATIC_TABLE.len())
            .cloned()
            .ok_or(HpackError::BadIndex)
    }

    /// Inserts at index 62, evicting from the back.
    ///
    /// An entry larger than the whole table empties it, which is not an
    /// error.
    pub(super) fn insert(&mut self, field: Field) {
        let size = field.size();
        if size > self.max_size {
            self.fields.clear();
            self.size = 0;
            return;
        }
        while self.max_size - self.size < size {
            self.evict();
        }
        self.size += size;
        self.fields.push_front(field);
    }

    pub(super) fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.size > self.max_size {
            self.evict();
        }
    }

    fn evict(&mut self) {
        if let Some(field) = self.fields.pop_back() {
            self.size -= field.size();
        }
    }

    #[cfg(test)]
    pub(super) fn size(&self) -> usize {
        self.size
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.fields.len()
    }
}

// ===== Test =====

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_static_lookup() {
        let table = DynamicTable::new(4096);
        let field = table.get(2).unwrap();
        assert_eq!(field.name.as_ref(), b":method");
        assert_eq!(field.value.as_ref(), b"GET");

        let field = table.get(61).unwrap();
        assert_eq!(field.name.as_ref(), b"www-authenticate");

        assert_eq!(table.get(0), Err(HpackError::BadIndex));
        assert_eq!(table.get(62), Err(HpackError::BadIndex));
    }

    #[test]
    fn test_insert_and_evict() {
        let mut table = DynamicTable::new(100);
        table.insert(Field::new(Bytes::from_static(b"aaaa"), Bytes::from_static(b"bbbb")));
        assert_eq!(table.size(), 40);
        assert_eq!(table.get(62).unwrap().name.as_ref(), b"aaaa");

        table.insert(Field::new(Bytes::from_static(b"cccc"), Bytes::from_static(b"dddd")));
        assert_eq!(table.size(), 80);
        // most recent entry sits at 62
        assert_eq!(table.get(62).unwrap().name.as_ref(), b"cccc");
        assert_eq!(table.get(63).unwrap().name.as_ref(), b"aaaa");

        // forces eviction of the oldest
        table.insert(Field::new(Bytes::from_static(b"eeee"), Bytes::from_static(b"ffff")));
        assert_eq!(table.size(), 80);
        assert_eq!(table.get(63).unwrap().name.as_ref(), b"cccc");
        assert_eq!(table.get(64), Err(HpackError::BadIndex));
    }

    #[test]
    fn test_oversize_entry_clears() {
        let mut table = DynamicTable::new(64);
        table.insert(Field::new(Bytes::from_static(b"a"), Bytes::from_static(b"b")));
        table.insert(Field::new(
            Bytes::from_static(b"netscape-navigator-compatibility"),
            Bytes::from_static(b"a-value-larger-than-the-whole-table"),
        ));
        assert_eq!(table.len(), 0);
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn test_resize_evicts() {
        let mut table = DynamicTable::new(100);
        table.insert(Field::new(Bytes::from_static(b"aaaa"), Bytes::from_static(b"bbbb")));
        table.insert(Field::new(Bytes::from_static(b"cccc"), Bytes::from_static(b"dddd")));
        table.resize(40);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(62).unwrap().name.as_ref(), b"cccc");
    }
}
