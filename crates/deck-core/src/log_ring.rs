use std::collections::VecDeque;

/// Bounded, arrival-ordered line buffer. Oldest lines are evicted first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    /// Drops the current contents and keeps the last `capacity` of `lines`.
    pub fn replace<I>(&mut self, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.lines.clear();
        for line in lines {
            self.push(line);
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// The most recent `limit` lines, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}
