//! Uplink polling position.

use std::collections::BTreeSet;

use imok_core::relay::RelayRecord;

/// Where the next uplink poll starts.
///
/// The relay is queried from the watermark inclusively, so the records stored
/// at exactly that millisecond come back again. The cursor remembers their
/// keys so they are delivered only once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayCursor {
    watermark_ms: i64,
    seen_at_watermark: BTreeSet<String>,
}

impl RelayCursor {
    /// A cursor that accepts everything stored at or after `from_ms`.
    pub fn since(from_ms: i64) -> Self {
        RelayCursor {
            watermark_ms: from_ms,
            seen_at_watermark: BTreeSet::new(),
        }
    }

    /// Time of the newest record delivered so far.
    pub fn watermark_ms(&self) -> i64 {
        self.watermark_ms
    }

    /// Whether `record` is behind the cursor.
    pub fn has_passed(&self, record: &RelayRecord) -> bool {
        record.time_ms < self.watermark_ms
            || (record.time_ms == self.watermark_ms
                && self.seen_at_watermark.contains(&record.key))
    }

    /// The cursor after delivering `records`.
    ///
    /// The watermark only moves forward; records older than it are ignored.
    pub fn advanced<'a>(&self, records: impl IntoIterator<Item = &'a RelayRecord>) -> Self {
        let mut next = self.clone();
        for record in records {
            if record.time_ms > next.watermark_ms {
                next.watermark_ms = record.time_ms;
                next.seen_at_watermark.clear();
            }
            if record.time_ms == next.watermark_ms {
                next.seen_at_watermark.insert(record.key.clone());
            }
        }
        next
    }
}
