//! Interviewer: the input protocol for human-in-the-loop stages.
//!
//! The trait is synchronous by design — console reads are blocking thread
//! work, and async callers go through `spawn_blocking`. Implementations
//! provided here: console (bounded single-reader timeout pattern),
//! auto-approve, queue, callback, and recording.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Questions and answers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionType {
    FreeText,
    YesNo,
    Confirm,
    SingleSelect,
    MultiSelect,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::FreeText => "free_text",
            QuestionType::YesNo => "yes_no",
            QuestionType::Confirm => "confirm",
            QuestionType::SingleSelect => "single_select",
            QuestionType::MultiSelect => "multi_select",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuestionOption {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct Question {
    /// Stage (node) the question belongs to; shown in the prompt banner.
    pub stage: String,
    pub text: String,
    pub question_type: QuestionType,
    pub options: Vec<QuestionOption>,
    pub default_choice: Option<String>,
    pub timeout: Option<Duration>,
}

impl Question {
    pub fn free_text(stage: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            text: text.into(),
            question_type: QuestionType::FreeText,
            options: Vec::new(),
            default_choice: None,
            timeout: None,
        }
    }
}

/// Answers carry a status bit set (timed-out, skipped) plus whichever of
/// text/value/values the question type fills in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Answer {
    pub text: String,
    pub value: String,
    pub values: Vec<String>,
    pub timed_out: bool,
    pub skipped: bool,
}

impl Answer {
    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    /// The single representative value for journaling.
    pub fn display_value(&self) -> String {
        if !self.value.is_empty() {
            self.value.clone()
        } else if !self.text.is_empty() {
            self.text.clone()
        } else {
            self.values.join(",")
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

pub trait Interviewer: Send + Sync {
    fn ask(&self, question: &Question) -> Answer;

    fn ask_multiple(&self, questions: &[Question]) -> Vec<Answer> {
        questions.iter().map(|q| self.ask(q)).collect()
    }

    fn inform(&self, message: &str, stage: &str);
}

/// Extract the accelerator key from an option label: `[K] Label`, `K) Label`,
/// `K - Label`, falling back to the first character.
pub fn accelerator_key(label: &str) -> String {
    let s = label.trim();
    let bytes = s.as_bytes();
    if bytes.is_empty() {
        return String::new();
    }
    if bytes.len() >= 4 && bytes[0] == b'[' && bytes[2] == b']' && bytes[3] == b' ' {
        return (bytes[1] as char).to_uppercase().to_string();
    }
    if bytes.len() >= 3 && bytes[1] == b')' && bytes[2] == b' ' {
        return (bytes[0] as char).to_uppercase().to_string();
    }
    if bytes.len() >= 4 && bytes[1] == b' ' && bytes[2] == b'-' && bytes[3] == b' ' {
        return (bytes[0] as char).to_uppercase().to_string();
    }
    s.chars()
        .next()
        .map(|c| c.to_uppercase().to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// ConsoleInterviewer — bounded single-reader timeout pattern
// ---------------------------------------------------------------------------

/// Prompts on an input/output stream pair. Designed for one human at the
/// terminal; concurrent callers receive timeout responses rather than
/// deadlocking.
///
/// Timeout handling uses the bounded single-reader pattern:
/// - At most one stranded reader thread outlives a timeout at any time.
/// - When the user types late, the stranded reader publishes to a
///   single-slot buffer; the next call drains the buffer without spawning a
///   new reader, so late input is never lost.
/// - Callers that cannot claim the reader wait on the slot up to a bounded
///   horizon (the question's timeout, or 5 seconds when it has none) and
///   then report timeout.
pub struct ConsoleInterviewer {
    input: Arc<Mutex<Box<dyn BufRead + Send>>>,
    output: Mutex<Box<dyn Write + Send>>,
    /// True while a reader (live or stranded) owns the input stream.
    reader_busy: Arc<AtomicBool>,
    pending_tx: SyncSender<String>,
    pending_rx: Mutex<Receiver<String>>,
    reader_spawns: AtomicUsize,
}

const CONTENDED_WAIT_HORIZON: Duration = Duration::from_secs(5);

impl ConsoleInterviewer {
    pub fn new(
        input: impl std::io::Read + Send + 'static,
        output: impl Write + Send + 'static,
    ) -> Self {
        let (pending_tx, pending_rx) = std::sync::mpsc::sync_channel(1);
        Self {
            input: Arc::new(Mutex::new(Box::new(std::io::BufReader::new(input)))),
            output: Mutex::new(Box::new(output)),
            reader_busy: Arc::new(AtomicBool::new(false)),
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            reader_spawns: AtomicUsize::new(0),
        }
    }

    pub fn stdio() -> Self {
        Self::new(std::io::stdin(), std::io::stdout())
    }

    /// Number of reader threads ever spawned; the bounded single-reader
    /// invariant keeps this from growing across timeouts.
    pub fn reader_spawn_count(&self) -> usize {
        self.reader_spawns.load(Ordering::SeqCst)
    }

    fn write_out(&self, text: &str) {
        let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    /// Read one line, honoring the timeout. Returns `None` on timeout.
    fn read_line_with_timeout(&self, timeout: Option<Duration>) -> Option<String> {
        // Drain a previously-stranded reader's result first. That is real
        // user input typed after an earlier timeout fired.
        {
            let rx = self.pending_rx.lock().unwrap_or_else(|e| e.into_inner());
            if let Ok(line) = rx.try_recv() {
                self.reader_busy.store(false, Ordering::SeqCst);
                return Some(line);
            }
        }

        // Claim the reader. On contention a stranded or concurrent reader
        // owns the stream; wait on the slot up to a bounded horizon instead
        // of stacking another reader on the same stream.
        if self
            .reader_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let bounded = timeout
                .filter(|t| !t.is_zero())
                .unwrap_or(CONTENDED_WAIT_HORIZON);
            let rx = self.pending_rx.lock().unwrap_or_else(|e| e.into_inner());
            return match rx.recv_timeout(bounded) {
                Ok(line) => {
                    self.reader_busy.store(false, Ordering::SeqCst);
                    Some(line)
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            };
        }

        // We own the read. The read itself happens on its own thread so a
        // timeout can strand it without blocking this caller.
        self.reader_spawns.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = std::sync::mpsc::sync_channel::<Option<String>>(1);
        let input = Arc::clone(&self.input);
        std::thread::spawn(move || {
            let mut line = String::new();
            let result = {
                let mut guard = input.lock().unwrap_or_else(|e| e.into_inner());
                guard.read_line(&mut line)
            };
            let _ = tx.send(result.ok().map(|_| line));
        });

        let received = match timeout.filter(|t| !t.is_zero()) {
            None => rx.recv().ok().flatten(),
            Some(t) => match rx.recv_timeout(t) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    // Stranded. Route its eventual result to the single-slot
                    // buffer and release the claim once it lands there.
                    let pending_tx = self.pending_tx.clone();
                    let busy = Arc::clone(&self.reader_busy);
                    std::thread::spawn(move || {
                        if let Ok(Some(line)) = rx.recv() {
                            match pending_tx.try_send(line) {
                                Ok(()) | Err(TrySendError::Full(_)) => {}
                                Err(TrySendError::Disconnected(_)) => {}
                            }
                        }
                        busy.store(false, Ordering::SeqCst);
                    });
                    return None;
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };

        self.reader_busy.store(false, Ordering::SeqCst);
        received
    }
}

impl Interviewer for ConsoleInterviewer {
    fn ask(&self, q: &Question) -> Answer {
        self.write_out(&format!("\n[{}] {}\n", q.stage, q.text.trim()));

        match q.question_type {
            QuestionType::FreeText => {
                self.write_out("> ");
                match self.read_line_with_timeout(q.timeout) {
                    Some(s) => Answer {
                        text: s.trim().to_string(),
                        ..Default::default()
                    },
                    None => Answer::timed_out(),
                }
            }
            QuestionType::YesNo | QuestionType::Confirm => {
                self.write_out("(y/n)> ");
                match self.read_line_with_timeout(q.timeout) {
                    Some(s) => {
                        let s = s.trim().to_lowercase();
                        Answer {
                            value: if s == "y" || s == "yes" {
                                "YES".into()
                            } else {
                                "NO".into()
                            },
                            ..Default::default()
                        }
                    }
                    None => Answer::timed_out(),
                }
            }
            QuestionType::MultiSelect => {
                for o in &q.options {
                    self.write_out(&format!("  [{}] {}\n", o.key, o.label));
                }
                self.write_out("comma-separated> ");
                match self.read_line_with_timeout(q.timeout) {
                    Some(s) => {
                        let values: Vec<String> = s
                            .trim()
                            .split(',')
                            .map(str::trim)
                            .filter(|v| !v.is_empty())
                            .map(String::from)
                            .collect();
                        Answer {
                            values,
                            ..Default::default()
                        }
                    }
                    None => Answer::timed_out(),
                }
            }
            QuestionType::SingleSelect => {
                for o in &q.options {
                    self.write_out(&format!("  [{}] {}\n", o.key, o.label));
                }
                self.write_out("> ");
                match self.read_line_with_timeout(q.timeout) {
                    Some(s) => Answer {
                        value: s.trim().to_string(),
                        ..Default::default()
                    },
                    None => Answer::timed_out(),
                }
            }
        }
    }

    fn inform(&self, message: &str, stage: &str) {
        self.write_out(&format!("\n[{}] {}\n", stage, message));
    }
}

// ---------------------------------------------------------------------------
// AutoApproveInterviewer
// ---------------------------------------------------------------------------

/// Picks the first option, or YES when there are none. For unattended runs.
pub struct AutoApproveInterviewer;

impl Interviewer for AutoApproveInterviewer {
    fn ask(&self, q: &Question) -> Answer {
        match q.options.first() {
            Some(option) => Answer {
                value: option.key.clone(),
                ..Default::default()
            },
            None => Answer {
                value: "YES".into(),
                ..Default::default()
            },
        }
    }

    fn inform(&self, _message: &str, _stage: &str) {}
}

// ---------------------------------------------------------------------------
// QueueInterviewer
// ---------------------------------------------------------------------------

/// Returns pre-seeded answers in order; `skipped` when exhausted.
pub struct QueueInterviewer {
    answers: Mutex<VecDeque<Answer>>,
}

impl QueueInterviewer {
    pub fn new(answers: Vec<Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
        }
    }
}

impl Interviewer for QueueInterviewer {
    fn ask(&self, _q: &Question) -> Answer {
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(Answer::skipped)
    }

    fn inform(&self, _message: &str, _stage: &str) {}
}

// ---------------------------------------------------------------------------
// CallbackInterviewer
// ---------------------------------------------------------------------------

/// Delegates every question to a supplied function.
pub struct CallbackInterviewer {
    callback: Box<dyn Fn(&Question) -> Answer + Send + Sync>,
}

impl CallbackInterviewer {
    pub fn new(callback: impl Fn(&Question) -> Answer + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl Interviewer for CallbackInterviewer {
    fn ask(&self, q: &Question) -> Answer {
        (self.callback)(q)
    }

    fn inform(&self, _message: &str, _stage: &str) {}
}

// ---------------------------------------------------------------------------
// RecordingInterviewer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QaPair {
    pub question: Question,
    pub answer: Answer,
}

/// Wraps another interviewer and records all Q&A pairs for replay and audit.
pub struct RecordingInterviewer {
    inner: Arc<dyn Interviewer>,
    recordings: Mutex<Vec<QaPair>>,
}

impl RecordingInterviewer {
    pub fn new(inner: Arc<dyn Interviewer>) -> Self {
        Self {
            inner,
            recordings: Mutex::new(Vec::new()),
        }
    }

    pub fn recordings(&self) -> Vec<QaPair> {
        self.recordings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Interviewer for RecordingInterviewer {
    fn ask(&self, q: &Question) -> Answer {
        let answer = self.inner.ask(q);
        self.recordings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(QaPair {
                question: q.clone(),
                answer: answer.clone(),
            });
        answer
    }

    fn inform(&self, message: &str, stage: &str) {
        self.inner.inform(message, stage);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::mpsc;

    /// Blocking reader fed from a channel; models a human typing.
    struct ChannelReader {
        rx: mpsc::Receiver<Vec<u8>>,
        buf: Vec<u8>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            if self.buf.is_empty() {
                match self.rx.recv() {
                    Ok(bytes) => self.buf = bytes,
                    Err(_) => return Ok(0),
                }
            }
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            Ok(n)
        }
    }

    fn channel_console() -> (ConsoleInterviewer, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let console = ConsoleInterviewer::new(
            ChannelReader {
                rx,
                buf: Vec::new(),
            },
            std::io::sink(),
        );
        (console, tx)
    }

    fn quick_question(timeout_ms: u64) -> Question {
        let mut q = Question::free_text("review", "Proceed?");
        q.timeout = Some(Duration::from_millis(timeout_ms));
        q
    }

    #[test]
    fn console_reads_line_before_timeout() {
        let (console, tx) = channel_console();
        tx.send(b"looks good\n".to_vec()).unwrap();
        let a = console.ask(&quick_question(2_000));
        assert!(!a.timed_out);
        assert_eq!(a.text, "looks good");
    }

    #[test]
    fn console_times_out_without_input() {
        let (console, _tx) = channel_console();
        let a = console.ask(&quick_question(30));
        assert!(a.timed_out);
    }

    #[test]
    fn console_yes_no_normalizes() {
        let (console, tx) = channel_console();
        let mut q = quick_question(2_000);
        q.question_type = QuestionType::YesNo;
        tx.send(b"YES\n".to_vec()).unwrap();
        assert_eq!(console.ask(&q).value, "YES");
        tx.send(b"nah\n".to_vec()).unwrap();
        assert_eq!(console.ask(&q).value, "NO");
    }

    #[test]
    fn console_multi_select_splits_on_commas() {
        let (console, tx) = channel_console();
        let mut q = quick_question(2_000);
        q.question_type = QuestionType::MultiSelect;
        tx.send(b"a, b , ,c\n".to_vec()).unwrap();
        assert_eq!(console.ask(&q).values, vec!["a", "b", "c"]);
    }

    // Ten consecutive timeouts followed by one late input line: the next
    // call drains the stranded reader's result, and the total number of
    // reader threads stays bounded.
    #[test]
    fn console_bounded_single_reader_across_timeouts() {
        let (console, tx) = channel_console();

        for _ in 0..10 {
            let a = console.ask(&quick_question(15));
            assert!(a.timed_out);
        }
        // Exactly one reader was spawned; the other nine calls waited on
        // the slot instead of stacking readers on the stream.
        assert_eq!(console.reader_spawn_count(), 1);

        // The user finally types. The stranded reader publishes the line;
        // the next ask drains it without spawning a new reader.
        tx.send(b"late answer\n".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let a = console.ask(&quick_question(2_000));
        assert!(!a.timed_out);
        assert_eq!(a.text, "late answer");
        assert_eq!(console.reader_spawn_count(), 1);

        // The stream is usable again for a fresh read.
        tx.send(b"fresh\n".to_vec()).unwrap();
        let a2 = console.ask(&quick_question(2_000));
        assert_eq!(a2.text, "fresh");
        assert_eq!(console.reader_spawn_count(), 2);
    }

    #[test]
    fn auto_approve_picks_first_option_or_yes() {
        let auto = AutoApproveInterviewer;
        let mut q = Question::free_text("s", "pick");
        q.question_type = QuestionType::SingleSelect;
        q.options = vec![
            QuestionOption {
                key: "A".into(),
                label: "[A] Approve".into(),
            },
            QuestionOption {
                key: "R".into(),
                label: "[R] Reject".into(),
            },
        ];
        assert_eq!(auto.ask(&q).value, "A");

        let bare = Question::free_text("s", "go ahead?");
        assert_eq!(auto.ask(&bare).value, "YES");
    }

    #[test]
    fn queue_returns_in_order_then_skipped() {
        let queue = QueueInterviewer::new(vec![
            Answer {
                value: "first".into(),
                ..Default::default()
            },
            Answer {
                value: "second".into(),
                ..Default::default()
            },
        ]);
        let q = Question::free_text("s", "?");
        assert_eq!(queue.ask(&q).value, "first");
        assert_eq!(queue.ask(&q).value, "second");
        assert!(queue.ask(&q).skipped);
    }

    #[test]
    fn callback_delegates() {
        let cb = CallbackInterviewer::new(|q| Answer {
            text: format!("saw: {}", q.text),
            ..Default::default()
        });
        assert_eq!(cb.ask(&Question::free_text("s", "ping")).text, "saw: ping");
    }

    #[test]
    fn recording_wraps_and_records() {
        let rec = RecordingInterviewer::new(Arc::new(AutoApproveInterviewer));
        let q1 = Question::free_text("a", "first?");
        let q2 = Question::free_text("b", "second?");
        rec.ask(&q1);
        rec.ask(&q2);

        let pairs = rec.recordings();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].question.text, "first?");
        assert_eq!(pairs[1].question.stage, "b");
        assert_eq!(pairs[0].answer.value, "YES");
    }

    #[test]
    fn accelerator_key_patterns() {
        assert_eq!(accelerator_key("[K] Keep"), "K");
        assert_eq!(accelerator_key("r) Reject"), "R");
        assert_eq!(accelerator_key("a - Approve"), "A");
        assert_eq!(accelerator_key("Fallback"), "F");
        assert_eq!(accelerator_key(""), "");
    }
}
