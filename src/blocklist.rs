use std::sync::Arc;

/// Query-name blocklist built from configured substring fragments.
///
/// A name is blocked when it contains any fragment as a plain substring,
/// matching the fragment's case exactly. Fragments are not anchored to label
/// boundaries, so "ads." also blocks "myads.test.".
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    fragments: Arc<Vec<String>>,
}

impl Blocklist {
    pub fn new(fragments: Vec<String>) -> Self {
        Self {
            fragments: Arc::new(fragments),
        }
    }

    /// Whether a query name matches any configured fragment.
    pub fn is_blocked(&self, name: &str) -> bool {
        self.fragments.iter().any(|fragment| name.contains(fragment))
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}
