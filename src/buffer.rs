//! Per-request accumulation buffer for streamed page records.

use crate::AttachmentRecord;

/// Accumulates the records of one in-flight page request, keeping them
/// invisible to consumers until the end-of-batch sentinel arrives.
///
/// A buffer is bound to the conversation generation that was current when
/// its request was issued; a truncation bumps the generation, letting the
/// loader recognise and drop the superseded batch.
#[derive(Debug)]
pub struct BatchBuffer {
    records: Vec<AttachmentRecord>,
    generation: u64,
}

impl BatchBuffer {
    pub fn new(generation: u64) -> Self {
        Self {
            records: Vec::new(),
            generation,
        }
    }

    /// Append one streamed record
    pub fn push(&mut self, record: AttachmentRecord) {
        self.records.push(record);
    }

    /// Drain the accumulated records, leaving the buffer empty.
    ///
    /// Called exactly once per page request, on the end-of-batch sentinel.
    pub fn complete(&mut self) -> Vec<AttachmentRecord> {
        std::mem::take(&mut self.records)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_drains() {
        let mut buffer = BatchBuffer::new(3);
        buffer.push(AttachmentRecord::sent(1, 100));
        buffer.push(AttachmentRecord::sent(2, 99));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.generation(), 3);

        let records = buffer.complete();
        assert_eq!(records.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_batch_completes_empty() {
        let mut buffer = BatchBuffer::new(0);
        assert!(buffer.complete().is_empty());
    }
}
