//! Chunk Producer: turns an incoming message stream into fixed-budget,
//! overlapping chunks.
//!
//! Messages are buffered one at a time; once buffered tokens reach 70% of
//! the configured threshold a chunk is emitted and the trailing overlap
//! fraction of the buffer is carried forward as the seed of the next chunk.
//! Emission is append-only and strictly ordered by arrival.

use crate::compress::ChunkSummary;
use crate::text::estimate_tokens;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fraction of the token threshold at which a chunk is emitted.
const EMIT_FRACTION: f64 = 0.7;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single immutable conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Partition identity (project + branch, or equivalent).
    pub scope_key: String,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>, scope_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            scope_key: scope_key.into(),
        }
    }

    /// Estimated token count of this message's content.
    pub fn token_count(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// Processing status of a chunk.
///
/// Status only moves forward along `Pending -> Summarizing -> Summarized ->
/// Merged`; the one allowed reversal is `Summarizing -> Pending` on a failed
/// attempt. Transitions are owned exclusively by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Summarizing,
    Summarized,
    Merged,
}

/// A token-bounded, overlapping slice of the message stream: the unit of
/// compression. Never deleted, only status-advanced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub scope_key: String,
    /// Ordered message slice, including carried-over overlap messages.
    pub messages: Vec<Message>,
    /// Absolute stream index of the first message in `messages`.
    pub start_index: usize,
    /// Absolute stream index one past the last message in `messages`.
    pub end_index: usize,
    /// Number of leading messages that repeat the previous chunk's tail.
    pub overlap_len: usize,
    pub token_count: usize,
    pub status: ChunkStatus,
    pub created_at: DateTime<Utc>,
    pub summary: Option<ChunkSummary>,
}

impl Chunk {
    /// Full text of the chunk, one message per line.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The messages exclusive to this chunk (overlap seed excluded).
    pub fn non_overlap_messages(&self) -> &[Message] {
        &self.messages[self.overlap_len..]
    }
}

/// Buffers messages for one scope and emits chunks at the token threshold.
#[derive(Debug)]
pub struct ChunkProducer {
    scope_key: String,
    /// Configured chunk token budget (chunks emit at 70% of this).
    token_threshold: usize,
    /// Percent of buffered messages retained as the next chunk's seed.
    overlap_percent: u8,
    buffer: Vec<Message>,
    buffered_tokens: usize,
    /// How many messages at the front of `buffer` are carried-over overlap.
    overlap_len: usize,
    /// Absolute stream index of `buffer[overlap_len]`.
    next_index: usize,
    emitted: u64,
}

impl ChunkProducer {
    pub fn new(scope_key: impl Into<String>, token_threshold: usize, overlap_percent: u8) -> Self {
        Self {
            scope_key: scope_key.into(),
            token_threshold: token_threshold.max(1),
            overlap_percent,
            buffer: Vec::new(),
            buffered_tokens: 0,
            overlap_len: 0,
            next_index: 0,
            emitted: 0,
        }
    }

    /// Token level at which a chunk is emitted.
    fn emit_threshold(&self) -> usize {
        ((self.token_threshold as f64) * EMIT_FRACTION).ceil() as usize
    }

    /// Accept one message; returns any chunks emitted as a result.
    ///
    /// A single message larger than the threshold is sub-chunked by the same
    /// token-counting rule so no message is ever dropped.
    pub fn push(&mut self, message: Message) -> Vec<Chunk> {
        let mut emitted = Vec::new();

        if message.token_count() >= self.token_threshold {
            // Flush whatever is buffered first so ordering is preserved,
            // then sub-chunk the oversized message.
            if let Some(chunk) = self.emit_chunk() {
                emitted.push(chunk);
            }
            for piece in split_oversized(&message, self.emit_threshold()) {
                self.buffer_message(piece);
                if let Some(chunk) = self.try_emit() {
                    emitted.push(chunk);
                }
            }
            return emitted;
        }

        self.buffer_message(message);
        if let Some(chunk) = self.try_emit() {
            emitted.push(chunk);
        }
        emitted
    }

    /// Emit any remaining buffered messages as a final partial chunk.
    pub fn flush(&mut self) -> Option<Chunk> {
        if self.buffer.len() > self.overlap_len {
            self.emit_chunk()
        } else {
            None
        }
    }

    /// Number of messages currently buffered (overlap seed included).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn buffer_message(&mut self, message: Message) {
        self.buffered_tokens += message.token_count();
        self.buffer.push(message);
    }

    fn try_emit(&mut self) -> Option<Chunk> {
        if self.buffered_tokens >= self.emit_threshold() {
            self.emit_chunk()
        } else {
            None
        }
    }

    fn emit_chunk(&mut self) -> Option<Chunk> {
        if self.buffer.len() <= self.overlap_len {
            return None;
        }

        self.emitted += 1;
        let id = format!("{}-chunk-{:06}", self.scope_key, self.emitted);
        let messages = std::mem::take(&mut self.buffer);
        let fresh = messages.len() - self.overlap_len;
        let start_index = self.next_index - self.overlap_len;
        let end_index = self.next_index + fresh;
        let token_count = messages.iter().map(Message::token_count).sum();

        let chunk = Chunk {
            id,
            scope_key: self.scope_key.clone(),
            start_index,
            end_index,
            overlap_len: self.overlap_len,
            token_count,
            status: ChunkStatus::Pending,
            created_at: Utc::now(),
            summary: None,
            messages: messages.clone(),
        };

        // Retain the trailing overlap fraction as the seed of the next chunk.
        let keep = (messages.len() * self.overlap_percent as usize).div_ceil(100);
        let keep = keep.min(messages.len().saturating_sub(1));
        self.buffer = messages[messages.len() - keep..].to_vec();
        self.buffered_tokens = self.buffer.iter().map(Message::token_count).sum();
        self.overlap_len = keep;
        self.next_index = end_index;

        debug!(
            chunk_id = %chunk.id,
            tokens = chunk.token_count,
            overlap = keep,
            "emitted chunk"
        );
        Some(chunk)
    }
}

/// Split an oversized message into pieces each below the emit threshold.
fn split_oversized(message: &Message, max_tokens: usize) -> Vec<Message> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;
    let mut part = 0usize;

    for word in message.content.split_whitespace() {
        let word_tokens = estimate_tokens(word);
        if current_tokens + word_tokens > max_tokens && !current.is_empty() {
            pieces.push(subpiece(message, &current, part));
            part += 1;
            current.clear();
            current_tokens = 0;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
        current_tokens += word_tokens;
    }
    if !current.is_empty() {
        pieces.push(subpiece(message, &current, part));
    }
    pieces
}

fn subpiece(message: &Message, content: &str, part: usize) -> Message {
    Message {
        id: format!("{}#{}", message.id, part),
        role: message.role,
        content: content.to_string(),
        timestamp: message.timestamp,
        scope_key: message.scope_key.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(i: usize, content: &str) -> Message {
        Message::new(format!("m{i}"), Role::User, content, "test-scope")
    }

    #[test]
    fn test_no_emission_below_threshold() {
        let mut producer = ChunkProducer::new("test-scope", 500, 10);
        for i in 0..100 {
            let emitted = producer.push(msg(i, "x"));
            assert!(emitted.is_empty());
        }
        assert_eq!(producer.buffered(), 100);
    }

    #[test]
    fn test_emits_at_seventy_percent() {
        // threshold 500 -> emit at 350 buffered tokens
        let mut producer = ChunkProducer::new("test-scope", 500, 10);
        let mut chunks = Vec::new();
        for i in 0..520 {
            chunks.extend(producer.push(msg(i, "x")));
        }
        assert!(!chunks.is_empty());
        let first = &chunks[0];
        assert_eq!(first.messages.len(), 350);
        assert_eq!(first.overlap_len, 0);
        assert_eq!(first.status, ChunkStatus::Pending);
        // 10% of the 350 buffered messages carried forward as overlap seed
        assert_eq!(producer.buffered(), 35 + (520 - 350));
    }

    #[test]
    fn test_overlap_carried_forward() {
        let mut producer = ChunkProducer::new("test-scope", 100, 10);
        let mut chunks = Vec::new();
        for i in 0..200 {
            chunks.extend(producer.push(msg(i, "x")));
        }
        chunks.extend(producer.flush());
        assert!(chunks.len() >= 2);
        let first = &chunks[0];
        let second = &chunks[1];
        assert_eq!(second.overlap_len, 7); // ceil(10% of 70)
        // The second chunk's leading messages repeat the first chunk's tail
        let tail: Vec<&str> = first.messages[first.messages.len() - 7..]
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        let head: Vec<&str> = second.messages[..7].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(tail, head);
    }

    #[test]
    fn test_chunking_conservation() {
        // Concatenating the non-overlap ranges reproduces the stream exactly.
        let mut producer = ChunkProducer::new("test-scope", 100, 10);
        let mut chunks = Vec::new();
        for i in 0..500 {
            chunks.extend(producer.push(msg(i, "x")));
        }
        chunks.extend(producer.flush());

        let mut seen = Vec::new();
        for chunk in &chunks {
            for m in chunk.non_overlap_messages() {
                seen.push(m.id.clone());
            }
        }
        let expected: Vec<String> = (0..500).map(|i| format!("m{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_oversized_message_subchunked() {
        let mut producer = ChunkProducer::new("test-scope", 100, 10);
        // One message of ~600 single-char words (600 tokens > 100 threshold)
        let content = vec!["x"; 600].join(" ");
        let chunks = producer.push(msg(0, &content));
        assert!(chunks.len() >= 2);
        // No content dropped: total fresh tokens cover all 600 words
        let flushed = producer.flush();
        let total_words: usize = chunks
            .iter()
            .chain(flushed.iter())
            .flat_map(|c| c.non_overlap_messages())
            .map(|m| m.content.split_whitespace().count())
            .sum();
        assert_eq!(total_words, 600);
    }

    #[test]
    fn test_indices_are_contiguous() {
        let mut producer = ChunkProducer::new("test-scope", 100, 10);
        let mut chunks = Vec::new();
        for i in 0..300 {
            chunks.extend(producer.push(msg(i, "x")));
        }
        chunks.extend(producer.flush());
        let mut next = 0usize;
        for chunk in &chunks {
            assert_eq!(chunk.start_index + chunk.overlap_len, next);
            next = chunk.end_index;
        }
        assert_eq!(next, 300);
    }
}
