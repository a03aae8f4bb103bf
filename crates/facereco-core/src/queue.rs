use std::collections::VecDeque;
use std::sync::Mutex;

/// Independently-locked FIFO handed between a producer thread and a worker.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn extend<I: IntoIterator<Item = T>>(&self, items: I) {
        self.lock().extend(items);
    }

    /// Oldest entry, if any.
    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    // Queue operations never leave partial state; recover from poisoning.
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}
