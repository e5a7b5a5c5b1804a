use super::augment::AugmentState;

/// A reversible session action.
#[derive(Debug, Clone)]
pub enum UndoEntry<C> {
    /// A sample block was appended to the store.
    Sample,
    /// The augment classifier was refit; `previous` is the state it replaced.
    Retrain { previous: AugmentState<C> },
}

/// Tag of an [`UndoEntry`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    Sample,
    Retrain,
}

impl<C> UndoEntry<C> {
    pub fn kind(&self) -> UndoKind {
        match self {
            UndoEntry::Sample => UndoKind::Sample,
            UndoEntry::Retrain { .. } => UndoKind::Retrain,
        }
    }
}

/// Stack of actions not yet undone, most recent last.
#[derive(Debug, Clone)]
pub struct UndoLog<C> {
    entries: Vec<UndoEntry<C>>,
}

impl<C> Default for UndoLog<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<C> UndoLog<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: UndoEntry<C>) {
        self.entries.push(entry);
    }

    pub fn pop(&mut self) -> Option<UndoEntry<C>> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn kinds(&self) -> Vec<UndoKind> {
        self.entries.iter().map(UndoEntry::kind).collect()
    }

    /// Pop every trailing `Retrain` entry.
    ///
    /// Returns the state captured by the earliest one popped, i.e. the
    /// classifier as it was before the whole run of retrains.
    pub fn pop_retrain_run(&mut self) -> Option<AugmentState<C>> {
        let mut earliest = None;
        while let Some(UndoEntry::Retrain { .. }) = self.entries.last() {
            if let Some(UndoEntry::Retrain { previous }) = self.entries.pop() {
                earliest = Some(previous);
            }
        }
        earliest
    }

    /// Pop the top entry if it is a `Sample`.
    pub fn pop_sample(&mut self) -> bool {
        if matches!(self.entries.last(), Some(UndoEntry::Sample)) {
            self.entries.pop();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Marker(u32);

    fn retrain(tag: u32) -> UndoEntry<Marker> {
        UndoEntry::Retrain {
            previous: AugmentState {
                classifier: Marker(tag),
                active: tag > 0,
            },
        }
    }

    #[test]
    fn retrain_run_returns_earliest_state() {
        let mut log = UndoLog::new();
        log.push(UndoEntry::Sample);
        log.push(retrain(0));
        log.push(retrain(1));
        log.push(retrain(2));
        let restored = log.pop_retrain_run().unwrap();
        assert_eq!(restored.classifier, Marker(0));
        assert!(!restored.active);
        assert_eq!(log.kinds(), vec![UndoKind::Sample]);
    }

    #[test]
    fn retrain_run_on_sample_top_is_noop() {
        let mut log: UndoLog<Marker> = UndoLog::new();
        log.push(UndoEntry::Sample);
        assert!(log.pop_retrain_run().is_none());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn pop_sample_only_takes_samples() {
        let mut log = UndoLog::new();
        log.push(retrain(3));
        assert!(!log.pop_sample());
        log.push(UndoEntry::Sample);
        assert!(log.pop_sample());
        assert_eq!(log.kinds(), vec![UndoKind::Retrain]);
        log.clear();
        assert!(log.is_empty());
    }
}
