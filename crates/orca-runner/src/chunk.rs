use std::mem;
use std::num::NonZeroUsize;

/// How captured lines are grouped before they reach a [`crate::ChunkSink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Chunking {
    Lines(NonZeroUsize),
    WholeOutput,
}

impl Chunking {
    /// Maps a configured line threshold; zero or negative disables chunking.
    pub fn from_threshold(lines: i64) -> Self {
        usize::try_from(lines)
            .ok()
            .and_then(NonZeroUsize::new)
            .map_or(Self::WholeOutput, Self::Lines)
    }
}

#[derive(Debug)]
pub struct ChunkBuffer {
    chunking: Chunking,
    text: String,
    lines: usize,
}

impl ChunkBuffer {
    pub fn new(chunking: Chunking) -> Self {
        Self {
            chunking,
            text: String::new(),
            lines: 0,
        }
    }

    /// Appends one line, newline included when the child wrote one, and hands
    /// back a full chunk once the threshold is reached.
    pub fn push(&mut self, line: &str) -> Option<String> {
        self.text.push_str(line);
        self.lines += 1;
        match self.chunking {
            Chunking::Lines(threshold) if self.lines >= threshold.get() => self.take(),
            _ => None,
        }
    }

    pub fn flush(&mut self) -> Option<String> {
        if self.lines == 0 {
            return None;
        }
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        self.lines = 0;
        Some(mem::take(&mut self.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(n: usize) -> Vec<String> {
        (1..=n).map(|idx| format!("line {idx}\n")).collect()
    }

    fn drive(chunking: Chunking, input: &[String]) -> Vec<String> {
        let mut buffer = ChunkBuffer::new(chunking);
        let mut chunks: Vec<String> = input.iter().filter_map(|l| buffer.push(l)).collect();
        chunks.extend(buffer.flush());
        chunks
    }

    #[test]
    fn delivers_ceil_of_lines_over_threshold() {
        for (total, threshold, expected) in [(5, 2, 3), (6, 3, 2), (1, 10, 1), (10, 1, 10)] {
            let input = lines(total);
            let chunking = Chunking::from_threshold(threshold);
            let chunks = drive(chunking, &input);

            assert_eq!(chunks.len(), expected, "n={total} t={threshold}");
            assert_eq!(chunks.concat(), input.concat());
        }
    }

    #[test]
    fn last_chunk_may_be_short() {
        let chunks = drive(Chunking::from_threshold(2), &lines(3));
        assert_eq!(chunks, vec!["line 1\nline 2\n", "line 3\n"]);
    }

    #[test]
    fn whole_output_flushes_once() {
        let chunks = drive(Chunking::WholeOutput, &lines(4));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn empty_output_delivers_nothing() {
        assert!(drive(Chunking::from_threshold(3), &[]).is_empty());
        assert!(drive(Chunking::WholeOutput, &[]).is_empty());
    }

    #[test]
    fn non_positive_threshold_disables_chunking() {
        assert_eq!(Chunking::from_threshold(0), Chunking::WholeOutput);
        assert_eq!(Chunking::from_threshold(-1), Chunking::WholeOutput);
    }
}
