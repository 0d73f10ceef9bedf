//! Enrollment storage contract and bounded retention.
//!
//! The matcher never touches storage. Callers take a [`EnrollmentStore::snapshot`]
//! and hand it to the matcher; [`enroll`] is the only operation that mutates.

use crate::types::EnrolledRecord;
use std::collections::VecDeque;
use std::convert::Infallible;

/// Default retention: keep the 10 most recent records.
pub const DEFAULT_CAPACITY: usize = 10;

/// Ordered collection of enrolled records, oldest first.
pub trait EnrollmentStore {
    type Error;

    /// Append a record as the newest entry.
    fn append(&mut self, record: EnrolledRecord) -> Result<(), Self::Error>;

    /// Number of stored records.
    fn len(&self) -> Result<usize, Self::Error>;

    /// Remove the oldest record, returning its identity, if any.
    fn evict_oldest(&mut self) -> Result<Option<String>, Self::Error>;

    /// Remove every record of `identity`, returning how many were removed.
    fn remove_identity(&mut self, identity: &str) -> Result<usize, Self::Error>;

    /// Records in enrollment order, optionally restricted to one group.
    fn snapshot(&self, group: Option<&str>) -> Result<Vec<EnrolledRecord>, Self::Error>;

    /// Remove every record.
    fn clear(&mut self) -> Result<(), Self::Error>;

    /// Append `record`, then evict oldest records until at most `capacity`
    /// remain. Returns evicted identities, oldest first.
    ///
    /// The default runs the steps one by one, so a failed eviction leaves the
    /// appended record in place. Stores that can apply the whole step
    /// atomically should override this.
    fn append_bounded(
        &mut self,
        record: EnrolledRecord,
        capacity: usize,
    ) -> Result<Vec<String>, Self::Error> {
        self.append(record)?;

        let mut evicted = Vec::new();
        let mut len = self.len()?;
        while len > capacity {
            match self.evict_oldest()? {
                Some(old) => evicted.push(old),
                None => break,
            }
            len -= 1;
        }
        Ok(evicted)
    }
}

/// Append `record` and evict oldest records until at most `capacity` remain.
///
/// Returns the identities of evicted records, oldest first. With
/// `capacity == 0` the store ends up empty.
pub fn enroll<S>(
    store: &mut S,
    record: EnrolledRecord,
    capacity: usize,
) -> Result<Vec<String>, S::Error>
where
    S: EnrollmentStore + ?Sized,
{
    store.append_bounded(record, capacity)
}

/// In-memory enrollment store.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    records: VecDeque<EnrolledRecord>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnrolledRecord> {
        self.records.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<EnrolledRecord> for Gallery {
    fn from_iter<I: IntoIterator<Item = EnrolledRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl EnrollmentStore for Gallery {
    type Error = Infallible;

    fn append(&mut self, record: EnrolledRecord) -> Result<(), Infallible> {
        self.records.push_back(record);
        Ok(())
    }

    fn len(&self) -> Result<usize, Infallible> {
        Ok(self.records.len())
    }

    fn evict_oldest(&mut self) -> Result<Option<String>, Infallible> {
        Ok(self.records.pop_front().map(|r| r.identity))
    }

    fn remove_identity(&mut self, identity: &str) -> Result<usize, Infallible> {
        let before = self.records.len();
        self.records.retain(|r| r.identity != identity);
        Ok(before - self.records.len())
    }

    fn snapshot(&self, group: Option<&str>) -> Result<Vec<EnrolledRecord>, Infallible> {
        Ok(self
            .records
            .iter()
            .filter(|r| group.map_or(true, |g| r.metadata.group.as_deref() == Some(g)))
            .cloned()
            .collect())
    }

    fn clear(&mut self) -> Result<(), Infallible> {
        self.records.clear();
        Ok(())
    }
}
