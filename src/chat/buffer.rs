// Per-recipient streaming buffer.
// Coalesces model deltas into platform-sized messages: flushes on sentence
// boundaries and size overflow, otherwise after a short quiet period, with
// a force flush as the upper bound. Sends for one recipient are serialized.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Delivery callback; failures are logged, never propagated
pub type SendFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync,
>;

pub fn send_fn<F, Fut>(f: F) -> SendFn
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |text| Box::pin(f(text)))
}

#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Quiet period before a partial buffer flushes
    pub delay: Duration,
    /// Buffer size that forces an immediate flush
    pub max_buffer_size: usize,
    /// Hard per-message limit of the destination platform
    pub platform_limit: usize,
    /// Upper bound on how long any text may sit buffered
    pub force_flush_after: Duration,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            max_buffer_size: 4096,
            platform_limit: 4000,
            force_flush_after: Duration::from_secs(10),
        }
    }
}

struct BufferState {
    buffer: String,
    /// Bumped on every add/flush; stale delayed flushes see a mismatch
    delay_generation: u64,
    force_timer_armed: bool,
    force_generation: u64,
    destroyed: bool,
}

#[derive(Clone)]
pub struct ResponseBuffer {
    send: SendFn,
    options: BufferOptions,
    state: Arc<Mutex<BufferState>>,
    /// Serializes sendFn invocations for this recipient
    send_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ResponseBuffer {
    pub fn new(send: SendFn, options: BufferOptions) -> Self {
        Self {
            send,
            options,
            state: Arc::new(Mutex::new(BufferState {
                buffer: String::new(),
                delay_generation: 0,
                force_timer_armed: false,
                force_generation: 0,
                destroyed: false,
            })),
            send_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Append a chunk to the buffer and decide whether to flush now, soon,
    /// or at the force deadline. Kept as a plain fn (not a method taking
    /// `&mut self`) so callers can run it while already holding the lock.
    fn append_and_decide(
        state: &mut BufferState,
        chunk: &str,
        max_buffer_size: usize,
    ) -> (bool, bool, u64) {
        state.buffer.push_str(chunk);
        state.delay_generation += 1;
        let delay_generation = state.delay_generation;

        let mut arm_force = false;
        if !state.force_timer_armed {
            state.force_timer_armed = true;
            arm_force = true;
        }

        let mut flush_now = false;
        if state.buffer.len() > max_buffer_size {
            flush_now = true;
        } else {
            let trimmed = chunk.trim_end();
            if trimmed.ends_with('.') || trimmed.ends_with('!') || trimmed.ends_with('?') {
                flush_now = true;
            }
        }

        (flush_now, arm_force, delay_generation)
    }

    /// Append a streamed chunk and decide whether to flush now, soon, or
    /// at the force deadline
    pub async fn add(&self, chunk: &str) {
        // The overflow-flush branch needs an `await` between dropping the
        // pre-overflow lock and re-acquiring it, so the two lock scopes are
        // kept separate (rather than a guard reassigned across the await)
        // to avoid holding a non-`Send` `MutexGuard` across the await point.
        enum Step {
            Destroyed,
            Done { flush_now: bool, arm_force: bool, delay_generation: u64 },
            Overflow(String),
        }

        let step = {
            let mut state = self.state.lock().expect("buffer lock poisoned");
            if state.destroyed {
                Step::Destroyed
            } else if !state.buffer.is_empty()
                && state.buffer.len() + chunk.len() > self.options.max_buffer_size
            {
                // A chunk that would cross the size boundary flushes the
                // existing buffer before the overflow is appended
                let text = std::mem::take(&mut state.buffer);
                state.delay_generation += 1;
                state.force_generation += 1;
                state.force_timer_armed = false;
                Step::Overflow(text)
            } else {
                let (flush_now, arm_force, delay_generation) =
                    Self::append_and_decide(&mut state, chunk, self.options.max_buffer_size);
                Step::Done { flush_now, arm_force, delay_generation }
            }
        };

        let (flush_now, arm_force, delay_generation) = match step {
            Step::Destroyed => return,
            Step::Done { flush_now, arm_force, delay_generation } => {
                (flush_now, arm_force, delay_generation)
            }
            Step::Overflow(text) => {
                self.deliver(text).await;
                let mut state = self.state.lock().expect("buffer lock poisoned");
                if state.destroyed {
                    return;
                }
                Self::append_and_decide(&mut state, chunk, self.options.max_buffer_size)
            }
        };

        if arm_force {
            let this = self.clone();
            let generation = {
                let state = self.state.lock().expect("buffer lock poisoned");
                state.force_generation
            };
            tokio::spawn(async move {
                tokio::time::sleep(this.options.force_flush_after).await;
                let still_armed = {
                    let state = this.state.lock().expect("buffer lock poisoned");
                    state.force_timer_armed && state.force_generation == generation
                };
                if still_armed {
                    this.flush().await;
                }
            });
        }

        if flush_now {
            self.flush().await;
            return;
        }

        // Delayed flush; superseded by any newer add
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.options.delay).await;
            let current = {
                let state = this.state.lock().expect("buffer lock poisoned");
                if state.destroyed {
                    return;
                }
                state.delay_generation
            };
            if current == delay_generation {
                this.flush().await;
            }
        });
    }

    /// Idempotent flush: cancels timers and delivers whatever is buffered
    pub async fn flush(&self) {
        let text = {
            let mut state = self.state.lock().expect("buffer lock poisoned");
            if state.destroyed {
                return;
            }
            state.delay_generation += 1;
            state.force_generation += 1;
            state.force_timer_armed = false;
            std::mem::take(&mut state.buffer)
        };

        if text.is_empty() {
            return;
        }
        self.deliver(text).await;
    }

    /// Cancel timers and drop buffered text
    pub fn destroy(&self) {
        let mut state = self.state.lock().expect("buffer lock poisoned");
        state.destroyed = true;
        state.buffer.clear();
        state.delay_generation += 1;
        state.force_generation += 1;
        state.force_timer_armed = false;
    }

    async fn deliver(&self, text: String) {
        let pieces = split_message(&text, self.options.platform_limit);
        let _guard = self.send_lock.lock().await;
        for piece in pieces {
            if let Err(err) = (self.send)(piece).await {
                log::warn!("message send failed: {}", err);
            }
        }
    }
}

/// Split `text` into pieces of at most `limit` characters, preferring
/// sentence boundaries, then word boundaries, then a hard cut. The pieces
/// concatenate back to the original text.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut remaining = text;

    while remaining.len() > limit {
        // Last char boundary at or before the limit
        let mut boundary = limit;
        while boundary > 0 && !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let window = &remaining[..boundary];

        // Prefer the last sentence end, then the last whitespace
        let sentence_end = window
            .char_indices()
            .filter(|(_, c)| matches!(c, '.' | '!' | '?'))
            .map(|(i, c)| i + c.len_utf8())
            .last();
        let word_end = window
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .map(|(i, c)| i + c.len_utf8())
            .last();

        let mut split_at = sentence_end.or(word_end).unwrap_or(boundary);
        if split_at == 0 {
            split_at = boundary;
        }

        pieces.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }

    if !remaining.is_empty() {
        pieces.push(remaining.to_string());
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collecting_send() -> (SendFn, Arc<StdMutex<Vec<String>>>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let sink = sent.clone();
        let f = send_fn(move |text: String| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(text);
                Ok(())
            }
        });
        (f, sent)
    }

    fn options() -> BufferOptions {
        BufferOptions {
            delay: Duration::from_millis(30),
            max_buffer_size: 64,
            platform_limit: 50,
            force_flush_after: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn sentence_ending_chunk_flushes_immediately() {
        let (send, sent) = collecting_send();
        let buffer = ResponseBuffer::new(send, options());

        buffer.add("Hello there.").await;
        assert_eq!(sent.lock().unwrap().as_slice(), ["Hello there."]);
    }

    #[tokio::test]
    async fn partial_chunk_waits_for_delay() {
        let (send, sent) = collecting_send();
        let buffer = ResponseBuffer::new(send, options());

        buffer.add("partial tex").await;
        assert!(sent.lock().unwrap().is_empty(), "nothing sent yet");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sent.lock().unwrap().as_slice(), ["partial tex"]);
    }

    #[tokio::test]
    async fn newer_chunk_supersedes_pending_delay() {
        let (send, sent) = collecting_send();
        let buffer = ResponseBuffer::new(send, options());

        buffer.add("one ").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.add("two.").await; // sentence end flushes both
        assert_eq!(sent.lock().unwrap().as_slice(), ["one two."]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // The stale delayed flush must not produce an empty send
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oversize_chunk_flushes_buffer_before_overflow() {
        let (send, sent) = collecting_send();
        let buffer = ResponseBuffer::new(send, options());

        buffer.add("first part ").await;
        buffer.add(&"x".repeat(70)).await; // crosses max_buffer_size

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0], "first part ", "existing buffer flushed first");
        // Overflow chunk itself flushed immediately because it exceeds the cap
        assert_eq!(sent.iter().map(|s| s.len()).sum::<usize>(), 11 + 70);
        assert!(sent.iter().all(|s| s.len() <= 50));
    }

    #[tokio::test]
    async fn conservation_and_platform_limit() {
        let (send, sent) = collecting_send();
        let buffer = ResponseBuffer::new(send, options());

        let chunks = ["A sentence that goes on and on ", "and on and on. ", "Then more! ", "And a tail"];
        let mut total = 0;
        for chunk in chunks {
            total += chunk.len();
            buffer.add(chunk).await;
        }
        buffer.flush().await;

        let sent = sent.lock().unwrap();
        let sum: usize = sent.iter().map(|s| s.len()).sum();
        assert_eq!(sum, total, "no characters may be dropped or invented");
        assert!(sent.iter().all(|s| s.len() <= 50));
    }

    #[tokio::test]
    async fn flush_is_idempotent() {
        let (send, sent) = collecting_send();
        let buffer = ResponseBuffer::new(send, options());

        buffer.add("text without end").await;
        buffer.flush().await;
        buffer.flush().await;
        buffer.flush().await;
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroy_drops_buffered_text() {
        let (send, sent) = collecting_send();
        let buffer = ResponseBuffer::new(send, options());

        buffer.add("doomed text").await;
        buffer.destroy();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sent.lock().unwrap().is_empty());

        // Adds after destroy are ignored
        buffer.add("more.").await;
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_flush_fires_for_trickling_chunks() {
        let (send, sent) = collecting_send();
        let buffer = ResponseBuffer::new(
            send,
            BufferOptions {
                delay: Duration::from_millis(100),
                max_buffer_size: 4096,
                platform_limit: 4000,
                force_flush_after: Duration::from_millis(120),
            },
        );

        // Keep resetting the delay timer with sub-delay chunks
        for _ in 0..4 {
            buffer.add("drip ").await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(
            !sent.lock().unwrap().is_empty(),
            "force flush must have fired"
        );
    }

    #[test]
    fn split_prefers_sentence_then_word_then_hard() {
        let text = "First sentence. Second part has words only and then averyveryverylongword";
        let pieces = split_message(text, 20);
        assert!(pieces.iter().all(|p| p.len() <= 20));
        assert_eq!(pieces.concat(), text);
        assert_eq!(pieces[0], "First sentence.");

        // Pure long word forces hard cuts
        let long = "x".repeat(95);
        let pieces = split_message(&long, 20);
        assert_eq!(pieces.len(), 5);
        assert_eq!(pieces.concat(), long);
    }

    #[test]
    fn split_respects_utf8_boundaries() {
        let text = "héllo wörld ".repeat(10);
        let pieces = split_message(&text, 21);
        assert_eq!(pieces.concat(), text);
        assert!(pieces.iter().all(|p| p.len() <= 21));
    }
}
