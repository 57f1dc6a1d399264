use std::sync::Arc;

/**
One node of the ancestor chain: the file identity of an in-flight
directory, linked upward to its parent.

The chain is strictly upward-owning, so releasing a parent is impossible
while any descendant still holds its `Arc` — which is exactly the
lifetime the reorder machinery needs. Identity is `None` for directories
the walk never needed to stat (loop detection is off in that mode).
*/
#[derive(Debug)]
pub(crate) struct Ancestry {
    parent: Option<Arc<Ancestry>>,
    identity: Option<(u64, u64)>,
}

impl Ancestry {
    pub(crate) fn root(identity: Option<(u64, u64)>) -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            identity,
        })
    }

    pub(crate) fn child(parent: &Arc<Self>, identity: Option<(u64, u64)>) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            identity,
        })
    }

    /// Does `identity` already appear on the path from the root to here?
    pub(crate) fn contains(&self, identity: (u64, u64)) -> bool {
        let mut node = Some(self);
        while let Some(current) = node {
            if current.identity == Some(identity) {
                return true;
            }
            node = current.parent.as_deref();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::Ancestry;

    #[test]
    fn finds_identities_anywhere_on_the_chain() {
        let root = Ancestry::root(Some((1, 100)));
        let mid = Ancestry::child(&root, Some((1, 200)));
        let leaf = Ancestry::child(&mid, Some((2, 300)));

        assert!(leaf.contains((1, 100)));
        assert!(leaf.contains((1, 200)));
        assert!(leaf.contains((2, 300)));
        assert!(!leaf.contains((1, 300)));
        assert!(!root.contains((1, 200)));
    }

    #[test]
    fn unknown_identities_never_match() {
        let root = Ancestry::root(None);
        let leaf = Ancestry::child(&root, Some((5, 5)));
        assert!(!leaf.contains((0, 0)));
        assert!(leaf.contains((5, 5)));
    }
}
