//! Indexed error aggregation for fan-out launches

use std::fmt;

/// One failed launch: the caller-supplied index (if any) and the error.
#[derive(Debug)]
pub struct IndexedError {
    /// The index passed at launch, or `None` when the launch was unindexed.
    pub index: Option<usize>,

    /// What the task returned.
    pub error: anyhow::Error,
}

impl fmt::Display for IndexedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "[{}] {}", index, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Aggregated errors from a group of launches.
///
/// Exposes both the joined form (`Display`, [`std::error::Error`]) and the
/// per-launch list with indices ([`entries`](ErrorSet::entries)).
#[derive(Debug)]
pub struct ErrorSet {
    entries: Vec<IndexedError>,
}

impl ErrorSet {
    pub(crate) fn from_entries(entries: Vec<IndexedError>) -> Self {
        Self { entries }
    }

    /// The per-launch errors, in completion order.
    pub fn entries(&self) -> &[IndexedError] {
        &self.entries
    }

    /// Consume the set, yielding the per-launch errors.
    pub fn into_entries(self) -> Vec<IndexedError> {
        self.entries
    }

    /// The indices of the failed launches that supplied one, sorted.
    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.entries.iter().filter_map(|e| e.index).collect();
        indices.sort_unstable();
        indices
    }

    /// Number of failed launches.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no errors.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} launch(es) failed: ", self.entries.len())?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorSet {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.entries.first().map(|entry| {
            let source: &(dyn std::error::Error + 'static) = &*entry.error;
            source
        })
    }
}
